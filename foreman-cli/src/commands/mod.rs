pub mod checkpoint;
pub mod provenance;
pub mod run;
pub mod state;
pub mod status;

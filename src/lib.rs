pub mod config;
pub mod crm;
pub mod env_boot;
pub mod migration;
pub mod tracing;

pub mod util {
    pub mod env;
}

pub use migration::ids::{normalize_id, IdMap, IdMaps, SourceKey};
pub use migration::ledger::{JsonLedger, RollbackRegistrar};
pub use migration::pipeline::{MigrationEngine, RunContext, Stage, StageFailure};
pub use migration::result::MigrationResult;

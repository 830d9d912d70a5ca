#![deny(dead_code)]
#![deny(unused_imports)]

pub mod assemble;
pub mod config;
pub mod data;
pub mod external;
pub mod filter;
pub mod guard;
pub mod model;
pub mod pipeline;
pub mod stage;
pub mod store;
pub mod trees;

pub use assemble::{PredictionReport, ScoreResult, ScoreRow, StageResult, StageRow};
pub use config::PipelineConfig;
pub use data::{Biomarker, BiomarkerRecord, Dataset};
pub use filter::ExclusionReport;
pub use model::ModelBackend;
pub use pipeline::{PipelineError, Predictor, predict_score, predict_stage};
pub use stage::DipStage;

//! Shared fixtures for the integration tests: a synthetic cohort builder and
//! small hand-built model artifacts written into a temporary model store.

#![allow(dead_code)]

use dipstat::data::{Biomarker, BiomarkerRecord};
use dipstat::model::{ArtifactMetadata, ClassifierArtifact, LinkFunction, RegressorArtifact};
use dipstat::stage::DipStage;
use dipstat::store::{ArtifactStore, DEFAULT_MODEL_VERSION};
use dipstat::trees::TreeArrays;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fs;
use std::path::Path;

/// TREM_1 cut points used by [`stage_classifier`].
pub const DIP2_TREM_CUT: f64 = 300.0;
pub const DIP3_TREM_CUT: f64 = 700.0;

/// Builder for synthetic biomarker cohorts.
///
/// Record `i` (ids are `1..=n`) belongs to stage DIP1 when `i % 10 < 6`, DIP2
/// when `i % 10 < 9`, otherwise DIP3. Concentrations are drawn inside that
/// stage's band, so [`stage_classifier`] recovers the intended stage and the
/// batch is clearly skewed toward DIP1.
pub struct CohortBuilder {
    n_records: usize,
    seed: u64,
    missing: Vec<(Biomarker, String)>,
}

impl CohortBuilder {
    pub fn new(n_records: usize) -> Self {
        Self {
            n_records,
            seed: 42,
            missing: Vec::new(),
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Blanks `marker` for the given record ids.
    pub fn with_missing(mut self, marker: Biomarker, ids: &[&str]) -> Self {
        self.missing
            .extend(ids.iter().map(|id| (marker, id.to_string())));
        self
    }

    pub fn intended_stage(index: usize) -> DipStage {
        match index % 10 {
            0..=5 => DipStage::Dip1,
            6..=8 => DipStage::Dip2,
            _ => DipStage::Dip3,
        }
    }

    pub fn records(&self) -> Vec<BiomarkerRecord> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        (0..self.n_records)
            .map(|index| {
                let id = (index + 1).to_string();
                let (trem, il6, pct) = match Self::intended_stage(index) {
                    DipStage::Dip1 => (
                        rng.gen_range(60.0..280.0),
                        rng.gen_range(2.0..40.0),
                        rng.gen_range(0.05..0.8),
                    ),
                    DipStage::Dip2 => (
                        rng.gen_range(320.0..680.0),
                        rng.gen_range(40.0..400.0),
                        rng.gen_range(0.8..6.0),
                    ),
                    DipStage::Dip3 => (
                        rng.gen_range(720.0..1500.0),
                        rng.gen_range(400.0..5000.0),
                        rng.gen_range(6.0..60.0),
                    ),
                };
                let mut record = BiomarkerRecord::new(id, Some(trem), Some(il6), Some(pct));
                for (marker, missing_id) in &self.missing {
                    if *missing_id == record.id {
                        record.values[marker.index()] = None;
                    }
                }
                record
            })
            .collect()
    }

    /// The cohort as a TSV table with `NA` for missing values.
    pub fn to_tsv(&self) -> String {
        let mut text = String::from("ID\tTREM_1\tIL_6\tProcalcitonin\n");
        for record in self.records() {
            let cells: Vec<String> = record
                .values
                .iter()
                .map(|v| match v {
                    Some(v) => format!("{v:.4}"),
                    None => "NA".to_string(),
                })
                .collect();
            text.push_str(&format!("{}\t{}\n", record.id, cells.join("\t")));
        }
        text
    }

    pub fn write_tsv(&self, path: &Path) {
        fs::write(path, self.to_tsv()).expect("write cohort table");
    }
}

pub fn metadata(name: &str) -> ArtifactMetadata {
    ArtifactMetadata {
        name: name.to_string(),
        version: DEFAULT_MODEL_VERSION.to_string(),
        features: Biomarker::CANONICAL
            .iter()
            .map(|m| m.column_name().to_string())
            .collect(),
        description: "synthetic test model".to_string(),
    }
}

fn classes() -> Vec<String> {
    DipStage::ALL.iter().map(|s| s.label().to_string()).collect()
}

/// Two-split tree on TREM_1 plus a stump on IL_6, both leaning toward the TREM_1 band.
pub fn stage_classifier() -> ClassifierArtifact {
    let trem_tree = TreeArrays {
        feature: vec![0, -2, 0, -2, -2],
        threshold: vec![DIP2_TREM_CUT, -2.0, DIP3_TREM_CUT, -2.0, -2.0],
        left: vec![1, -1, 3, -1, -1],
        right: vec![2, -1, 4, -1, -1],
        value: vec![
            vec![1.0, 1.0, 1.0],
            vec![18.0, 2.0, 0.0],
            vec![1.0, 1.0, 1.0],
            vec![2.0, 16.0, 2.0],
            vec![0.0, 3.0, 17.0],
        ],
    };
    let il6_stump = TreeArrays {
        feature: vec![1, -2, -2],
        threshold: vec![400.0, -2.0, -2.0],
        left: vec![1, -1, -1],
        right: vec![2, -1, -1],
        value: vec![vec![1.0, 1.0, 1.0], vec![5.0, 4.0, 1.0], vec![1.0, 3.0, 6.0]],
    };
    ClassifierArtifact {
        metadata: metadata("dip_forest"),
        classes: classes(),
        trees: vec![trem_tree, il6_stump],
    }
}

/// A classifier whose only leaf puts equal weight on every stage.
pub fn uniform_classifier() -> ClassifierArtifact {
    ClassifierArtifact {
        metadata: metadata("uniform"),
        classes: classes(),
        trees: vec![TreeArrays {
            feature: vec![-2],
            threshold: vec![-2.0],
            left: vec![-1],
            right: vec![-1],
            value: vec![vec![1.0, 1.0, 1.0]],
        }],
    }
}

pub fn cdip_regressor() -> RegressorArtifact {
    RegressorArtifact {
        metadata: metadata("cdip_boost"),
        link: LinkFunction::Logit,
        base_score: -1.0,
        learning_rate: 1.0,
        trees: vec![
            TreeArrays {
                feature: vec![0, -2, -2],
                threshold: vec![500.0, -2.0, -2.0],
                left: vec![1, -1, -1],
                right: vec![2, -1, -1],
                value: vec![0.0, -1.0, 1.5],
            },
            TreeArrays {
                feature: vec![2, -2, -2],
                threshold: vec![5.0, -2.0, -2.0],
                left: vec![1, -1, -1],
                right: vec![2, -1, -1],
                value: vec![0.0, -0.5, 1.0],
            },
        ],
    }
}

/// Writes both artifacts under `<root>/v1/` and returns a store reading them.
pub fn write_store(root: &Path, classifier: &ClassifierArtifact, regressor: &RegressorArtifact) -> ArtifactStore {
    let store = ArtifactStore::new(root, DEFAULT_MODEL_VERSION);
    fs::create_dir_all(store.dir()).expect("create model directory");
    classifier
        .save(&store.classifier_path())
        .expect("save classifier");
    regressor.save(&store.regressor_path()).expect("save regressor");
    store
}

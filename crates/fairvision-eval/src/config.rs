//! YAML configuration loading for the `fairvision` binary.
//!
//! Files only supply defaults; command-line flags override them and the
//! result is validated before any checkpoint or dataset is touched.

use std::path::Path;

use fairvision_core::{EvalConfig, LoggingConfig, ModelHyperParams};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::training::TrainConfig;

/// Everything `fairvision train` reads from a config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainSetup {
    #[serde(default)]
    pub train: TrainConfig,
    #[serde(default)]
    pub model: ModelHyperParams,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Load an [`EvalConfig`] from a YAML file at `path`.
///
/// # Errors
///
/// Returns an error if the file cannot be read or the YAML is invalid.
pub fn load_eval_config(path: &Path) -> anyhow::Result<EvalConfig> {
    load_yaml(path)
}

/// Load a [`TrainSetup`] from a YAML file at `path`.
pub fn load_train_setup(path: &Path) -> anyhow::Result<TrainSetup> {
    load_yaml(path)
}

fn load_yaml<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read config file {}: {}", path.display(), e))?;
    serde_yaml::from_str(&contents)
        .map_err(|e| anyhow::anyhow!("Failed to parse config YAML {}: {}", path.display(), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fairvision_core::{BackboneKind, ModelVariant, ScoreNormalization};
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_yaml(yaml: &str) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(yaml.as_bytes()).unwrap();
        f
    }

    #[test]
    fn test_load_eval_config_minimal() {
        let f = write_yaml("weights: runs/best\n");
        let config = load_eval_config(f.path()).unwrap();
        assert_eq!(config.weights, Path::new("runs/best"));
        assert_eq!(config.batch_size, 16);
        assert_eq!(config.log_path, Path::new("test.log"));
        assert!((config.subset_fraction - 1.0).abs() < 1e-12);
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_eval_config_full() {
        let yaml = r#"
weights: /models/celeba
data: /data/celeba/valid.safetensors
batch_size: 64
subset_fraction: 0.1
log_path: logs/eval.log
gpu_id: 1
decision_threshold: 0.3
num_groups: 3
show_progress: false
logging:
  level: debug
  format: json
"#;
        let f = write_yaml(yaml);
        let config = load_eval_config(f.path()).unwrap();
        assert_eq!(config.batch_size, 64);
        assert_eq!(config.gpu_id, 1);
        assert_eq!(config.decision_threshold, Some(0.3));
        assert_eq!(config.num_groups, 3);
        assert!(!config.show_progress);
        assert_eq!(config.logging.format, "json");
    }

    #[test]
    fn test_load_train_setup() {
        let yaml = r#"
train:
  output_dir: runs/debiased
  lr: 0.0005
  freeze_backbone: true
model:
  hidden_size: 256
  normalization: sigmoid
  variant: debiased
  backbone:
    kind: resnet
    depth: 50
"#;
        let f = write_yaml(yaml);
        let setup = load_train_setup(f.path()).unwrap();
        assert!((setup.train.lr - 5e-4).abs() < 1e-12);
        assert!(setup.train.freeze_backbone);
        assert_eq!(setup.train.batch_size, 16);
        assert_eq!(setup.model.hidden_size, 256);
        assert_eq!(setup.model.normalization, ScoreNormalization::Sigmoid);
        assert_eq!(setup.model.variant, ModelVariant::Debiased);
        assert_eq!(setup.model.backbone, BackboneKind::ResNet { depth: 50 });
    }

    #[test]
    fn test_load_config_missing_file() {
        assert!(load_eval_config(Path::new("/nonexistent/eval.yaml")).is_err());
    }

    #[test]
    fn test_load_config_invalid_yaml() {
        let f = write_yaml("not: [valid: yaml: {{{}}}");
        assert!(load_eval_config(f.path()).is_err());
    }

    #[test]
    fn test_eval_config_requires_weights() {
        let f = write_yaml("batch_size: 8\n");
        assert!(load_eval_config(f.path()).is_err());
    }
}

//! Build details exposed to resource scripts as environment variables.

use serde::{Deserialize, Serialize};

/// Supplies the `KEY=value` environment of a step's container.
pub trait StepMetadata: Send + Sync {
    fn env(&self) -> Vec<String>;
}

impl StepMetadata for Vec<String> {
    fn env(&self) -> Vec<String> {
        self.clone()
    }
}

/// Metadata of the build a step belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildStepMetadata {
    pub build_id: i64,
    pub build_name: String,
    pub team_name: String,
    pub pipeline_name: String,
    pub job_name: String,
    pub external_url: String,
}

impl StepMetadata for BuildStepMetadata {
    /// Empty fields are left out; `BUILD_ID` is always present.
    fn env(&self) -> Vec<String> {
        let mut env = vec![format!("BUILD_ID={}", self.build_id)];
        let named = [
            ("BUILD_NAME", &self.build_name),
            ("BUILD_TEAM_NAME", &self.team_name),
            ("BUILD_PIPELINE_NAME", &self.pipeline_name),
            ("BUILD_JOB_NAME", &self.job_name),
            ("ATC_EXTERNAL_URL", &self.external_url),
        ];
        for (key, value) in named {
            if !value.is_empty() {
                env.push(format!("{key}={value}"));
            }
        }
        env
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_metadata_env_skips_empty_fields() {
        let metadata = BuildStepMetadata {
            build_id: 42,
            build_name: "7".into(),
            team_name: "main".into(),
            pipeline_name: "pipeline".into(),
            ..Default::default()
        };
        assert_eq!(
            metadata.env(),
            vec![
                "BUILD_ID=42",
                "BUILD_NAME=7",
                "BUILD_TEAM_NAME=main",
                "BUILD_PIPELINE_NAME=pipeline",
            ]
        );
    }

    #[test]
    fn plain_env_list_passes_through() {
        let env = vec!["a=1".to_string(), "b=2".to_string()];
        assert_eq!(env.env(), vec!["a=1", "b=2"]);
    }
}

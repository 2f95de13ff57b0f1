// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Reduction script resolution.
//!
//! Every instrument has a script directory holding `reduce.py` and, optionally,
//! `reduce_vars.json`:
//!
//! ```json
//! {
//!     "standard_vars": { "sum_runs": false },
//!     "advanced_vars": { "binning": "0.5,-0.01,10" }
//! }
//! ```
//!
//! A missing `reduce.py` means the instrument is not configured for reduction.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::config::DEFAULT_SCRIPTS_DIR;
use crate::error::CoreError;
use crate::persistence::ReductionRunRecord;

const SCRIPT_FILE: &str = "reduce.py";
const VARS_FILE: &str = "reduce_vars.json";

/// A named script variable resolved for a run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunVariable {
    /// Variable name.
    pub name: String,
    /// Variable value.
    pub value: Value,
    /// Whether the variable belongs to the advanced set.
    pub is_advanced: bool,
}

/// Supplies reduction scripts and their arguments.
#[async_trait]
pub trait ScriptResolver: Send + Sync {
    /// Current script text for an instrument. `None` when the instrument has no
    /// reduction script.
    async fn current_script(&self, instrument: &str) -> Result<Option<String>, CoreError>;

    /// Variables a run of `instrument` will be reduced with. Empty when the
    /// instrument defines none.
    async fn variables_for_run(
        &self,
        instrument: &str,
        run: &ReductionRunRecord,
    ) -> Result<Vec<RunVariable>, CoreError>;

    /// Script text and arguments to hand to the reduction worker.
    async fn script_and_args(
        &self,
        instrument: &str,
        run: &ReductionRunRecord,
    ) -> Result<(String, Value), CoreError>;
}

#[derive(Debug, Default, Deserialize)]
struct VarsFile {
    #[serde(default)]
    standard_vars: Map<String, Value>,
    #[serde(default)]
    advanced_vars: Map<String, Value>,
}

/// Script resolver reading per-instrument directories.
#[derive(Debug, Clone)]
pub struct FsScriptResolver {
    template: String,
}

impl Default for FsScriptResolver {
    fn default() -> Self {
        Self::new(DEFAULT_SCRIPTS_DIR)
    }
}

impl FsScriptResolver {
    /// Create a resolver from a directory template. `{instrument}` is replaced
    /// by the instrument name.
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    /// Script directory for an instrument.
    pub fn dir_for(&self, instrument: &str) -> PathBuf {
        PathBuf::from(self.template.replace("{instrument}", instrument))
    }

    async fn read_optional(path: &Path, instrument: &str) -> Result<Option<String>, CoreError> {
        match tokio::fs::read_to_string(path).await {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CoreError::ScriptError {
                instrument: instrument.to_string(),
                details: format!("{}: {}", path.display(), e),
            }),
        }
    }

    async fn load_vars(&self, instrument: &str) -> Result<VarsFile, CoreError> {
        let path = self.dir_for(instrument).join(VARS_FILE);
        let Some(text) = Self::read_optional(&path, instrument).await? else {
            debug!(instrument = %instrument, path = %path.display(), "No variables file");
            return Ok(VarsFile::default());
        };

        serde_json::from_str(&text).map_err(|e| CoreError::ScriptError {
            instrument: instrument.to_string(),
            details: format!("{}: {}", path.display(), e),
        })
    }
}

#[async_trait]
impl ScriptResolver for FsScriptResolver {
    async fn current_script(&self, instrument: &str) -> Result<Option<String>, CoreError> {
        let path = self.dir_for(instrument).join(SCRIPT_FILE);
        Self::read_optional(&path, instrument).await
    }

    async fn variables_for_run(
        &self,
        instrument: &str,
        _run: &ReductionRunRecord,
    ) -> Result<Vec<RunVariable>, CoreError> {
        let vars = self.load_vars(instrument).await?;

        let standard = vars.standard_vars.into_iter().map(|(name, value)| RunVariable {
            name,
            value,
            is_advanced: false,
        });
        let advanced = vars.advanced_vars.into_iter().map(|(name, value)| RunVariable {
            name,
            value,
            is_advanced: true,
        });

        Ok(standard.chain(advanced).collect())
    }

    async fn script_and_args(
        &self,
        instrument: &str,
        run: &ReductionRunRecord,
    ) -> Result<(String, Value), CoreError> {
        let vars = self.load_vars(instrument).await?;
        let arguments = json!({
            "standard_vars": vars.standard_vars,
            "advanced_vars": vars.advanced_vars,
        });
        Ok((run.script.clone(), arguments))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::Status;
    use chrono::Utc;

    fn run_with_script(script: &str) -> ReductionRunRecord {
        let now = Utc::now();
        ReductionRunRecord {
            id: 1,
            experiment_id: 1,
            instrument_id: 1,
            run_number: 100,
            run_version: 0,
            run_name: String::new(),
            status: Status::Queued,
            created: now,
            last_updated: now,
            started: None,
            finished: None,
            message: None,
            reduction_log: String::new(),
            admin_log: String::new(),
            script: script.to_string(),
            cancel: false,
            hidden_in_failviewer: false,
            started_by: None,
            retry_when: None,
            retry_run_id: None,
        }
    }

    fn resolver_in(dir: &tempfile::TempDir) -> FsScriptResolver {
        FsScriptResolver::new(format!("{}/{{instrument}}", dir.path().display()))
    }

    #[test]
    fn test_dir_for_substitutes_instrument() {
        let resolver = FsScriptResolver::default();
        assert_eq!(
            resolver.dir_for("WISH"),
            PathBuf::from("/isis/NDXWISH/user/scripts/autoreduction")
        );
    }

    #[tokio::test]
    async fn test_current_script_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = resolver_in(&dir);
        assert_eq!(resolver.current_script("GEM").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_current_script_reads_reduce_py() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("GEM")).unwrap();
        std::fs::write(dir.path().join("GEM").join("reduce.py"), "def main(): pass\n").unwrap();

        let resolver = resolver_in(&dir);
        assert_eq!(
            resolver.current_script("GEM").await.unwrap().as_deref(),
            Some("def main(): pass\n")
        );
    }

    #[tokio::test]
    async fn test_variables_for_run() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("WISH")).unwrap();
        std::fs::write(
            dir.path().join("WISH").join("reduce_vars.json"),
            r#"{"standard_vars": {"sum_runs": false}, "advanced_vars": {"binning": "0.5"}}"#,
        )
        .unwrap();

        let resolver = resolver_in(&dir);
        let vars = resolver
            .variables_for_run("WISH", &run_with_script(""))
            .await
            .unwrap();
        assert_eq!(
            vars,
            vec![
                RunVariable {
                    name: "sum_runs".to_string(),
                    value: json!(false),
                    is_advanced: false,
                },
                RunVariable {
                    name: "binning".to_string(),
                    value: json!("0.5"),
                    is_advanced: true,
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_variables_for_run_without_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = resolver_in(&dir);
        let vars = resolver
            .variables_for_run("WISH", &run_with_script(""))
            .await
            .unwrap();
        assert!(vars.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_vars_file_is_script_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("WISH")).unwrap();
        std::fs::write(dir.path().join("WISH").join("reduce_vars.json"), "{not json").unwrap();

        let resolver = resolver_in(&dir);
        let err = resolver
            .script_and_args("WISH", &run_with_script(""))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "SCRIPT_ERROR");
    }

    #[tokio::test]
    async fn test_script_and_args_uses_run_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("GEM")).unwrap();
        std::fs::write(dir.path().join("GEM").join("reduce.py"), "new script").unwrap();

        let resolver = resolver_in(&dir);
        let (script, args) = resolver
            .script_and_args("GEM", &run_with_script("snapshot"))
            .await
            .unwrap();
        assert_eq!(script, "snapshot");
        assert_eq!(args, json!({"standard_vars": {}, "advanced_vars": {}}));
    }
}

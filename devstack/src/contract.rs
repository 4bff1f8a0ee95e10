// File: devstack/src/contract.rs
//
// Contract compilation. Runs the external `cargo contract build` toolchain
// under a process supervisor and collects its artifacts.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs;

use crate::error::BuildError;
use crate::process::{
    LaunchSpec, LogSink, MarkerExtractor, ProcessRole, ProcessSupervisor, SignalExtractor,
};

/// Line printed by cargo-contract right before the artifact directory.
pub const ARTIFACTS_READY_MARKER: &str = "Your contract artifacts are ready";

const OUTPUT_DIR_SIGNAL: &str = "output_dir";

/// Build step for one contract.
#[async_trait]
pub trait ContractBuilder: Send + Sync {
    /// Compile `contract` and return the directory holding its artifacts.
    ///
    /// # Errors
    ///
    /// Returns a `BuildError` when the toolchain fails or an artifact is missing.
    async fn build(&self, contract: &str, release: bool) -> Result<PathBuf, BuildError>;
}

/// `cargo contract build` over a project layout of
/// `<contracts_dir>/<name>/` sources and `<artifacts_dir>/<name>/` outputs.
#[derive(Debug, Clone)]
pub struct CargoContractBuilder {
    contracts_dir: PathBuf,
    artifacts_dir: PathBuf,
    cargo: PathBuf,
}

impl CargoContractBuilder {
    pub fn new(contracts_dir: impl Into<PathBuf>, artifacts_dir: impl Into<PathBuf>) -> Self {
        Self {
            contracts_dir: contracts_dir.into(),
            artifacts_dir: artifacts_dir.into(),
            cargo: PathBuf::from("cargo"),
        }
    }

    /// Use another cargo executable.
    pub fn with_cargo(mut self, cargo: impl Into<PathBuf>) -> Self {
        self.cargo = cargo.into();
        self
    }

    pub fn artifacts_dir(&self) -> &Path {
        &self.artifacts_dir
    }

    fn launch_spec(&self, contract_dir: &Path, release: bool) -> LaunchSpec {
        let mut spec = LaunchSpec::new(self.cargo.clone())
            .args(["contract", "build"])
            .current_dir(contract_dir);
        if release {
            spec = spec.arg("--release");
        }
        spec
    }
}

fn artifact_files(contract: &str) -> [String; 3] {
    [
        format!("{}.contract", contract),
        format!("{}.wasm", contract),
        format!("{}.json", contract),
    ]
}

#[async_trait]
impl ContractBuilder for CargoContractBuilder {
    async fn build(&self, contract: &str, release: bool) -> Result<PathBuf, BuildError> {
        let contract_dir = self.contracts_dir.join(contract);
        let spec = self.launch_spec(&contract_dir, release);

        log::info!("Building contract {}", contract);
        let extractor: Arc<dyn SignalExtractor> = Arc::new(MarkerExtractor::next_line(
            OUTPUT_DIR_SIGNAL,
            ARTIFACTS_READY_MARKER,
        ));
        let mut supervisor =
            ProcessSupervisor::new(ProcessRole::Builder).with_extractors(vec![extractor]);
        supervisor.start(&spec, LogSink::memory()).await?;
        let code = supervisor.wait_exit().await;
        let output = || supervisor.output_tail(usize::MAX).join("\n");

        if code != Some(0) {
            log::error!("Failed building contract {}", contract);
            return Err(BuildError::Failed {
                contract: contract.to_string(),
                code,
                output: output(),
            });
        }

        let Some(output_dir) = supervisor.signals().get(OUTPUT_DIR_SIGNAL) else {
            log::error!("Unable to detect output directory of contract {}", contract);
            return Err(BuildError::OutputDirectoryNotDetected {
                contract: contract.to_string(),
                output: output(),
            });
        };
        let output_dir = contract_dir.join(output_dir);

        let target_dir = self.artifacts_dir.join(contract);
        fs::create_dir_all(&target_dir).await?;

        for file in artifact_files(contract) {
            let source = output_dir.join(&file);
            if !fs::try_exists(&source).await.unwrap_or(false) {
                log::error!("File {} not generated under {}", file, output_dir.display());
                return Err(BuildError::MissingArtifact {
                    file,
                    dir: output_dir,
                });
            }
            fs::copy(&source, target_dir.join(&file)).await?;
            if log::log_enabled!(log::Level::Debug) {
                log::debug!("Copied {} to {}", file, target_dir.display());
            }
        }

        log::info!("Contract {} built into {}", contract, target_dir.display());
        Ok(target_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_launch_spec_flags() {
        let builder = CargoContractBuilder::new("contracts", "artifacts");
        let debug = builder.launch_spec(Path::new("contracts/flipper"), false);
        assert_eq!(debug.args, vec!["contract", "build"]);
        assert_eq!(debug.cwd.as_deref(), Some(Path::new("contracts/flipper")));

        let release = builder.launch_spec(Path::new("contracts/flipper"), true);
        assert_eq!(release.args, vec!["contract", "build", "--release"]);
    }

    #[test]
    fn test_artifact_files() {
        assert_eq!(
            artifact_files("flipper"),
            [
                "flipper.contract".to_string(),
                "flipper.wasm".to_string(),
                "flipper.json".to_string()
            ]
        );
    }
}

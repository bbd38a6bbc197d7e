use crate::template::Template;
use kiln_core::{
    DependencyFixResult, Result, SandboxConfig, ServiceMetadata, CONTAINER_WORKDIR, DOCS_PATH,
    RESULT_FILE,
};
use kiln_deps::{manifest, DependencyResolver, ImportSpec};
use std::path::{Path, PathBuf};
use tracing::{debug, instrument, warn};

pub const USER_CODE_FILE: &str = "user_code.py";
pub const RUNNER_FILE: &str = "runner.py";
pub const SERVICE_FILE: &str = "service.py";
pub const DOCKERFILE: &str = "Dockerfile";
pub const REQUIREMENTS_FILE: &str = "requirements.txt";

const RUNNER: Template = Template::new(RUNNER_FILE, include_str!("../templates/runner.py"));
const SERVICE: Template = Template::new(SERVICE_FILE, include_str!("../templates/service.py"));
const BUILD_FILE: Template = Template::new(DOCKERFILE, include_str!("../templates/Dockerfile"));

/// What the image build needs to know about a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildManifest {
    pub base_image: String,
    pub port: u16,
    pub dependencies: Vec<String>,
}

#[derive(Debug, Clone)]
pub enum PrepareMode {
    /// One-shot run through `runner.py`. `prelude` modules are bound into the
    /// user code's globals before it starts.
    Script { prelude: Vec<ImportSpec> },
    /// HTTP scaffold through `service.py`, listening on `port`.
    Service { port: u16, metadata: ServiceMetadata },
}

#[derive(Debug, Clone)]
pub struct PreparedCode {
    pub dir: PathBuf,
    pub entry_file: &'static str,
    pub fix: DependencyFixResult,
    pub manifest: Option<BuildManifest>,
}

impl PreparedCode {
    /// The user code as written to disk.
    pub fn code(&self) -> &str {
        &self.fix.fixed_code
    }

    /// In-container path of the entry program.
    pub fn entry_path(&self) -> String {
        format!("{}/{}", CONTAINER_WORKDIR, self.entry_file)
    }
}

/// Writes a sandbox's build context: the fixed user code, the entry program
/// wrapping it and a container build file.
#[derive(Debug, Clone)]
pub struct CodePreparer {
    resolver: DependencyResolver,
    base_image: String,
    interpreter: String,
}

impl CodePreparer {
    pub fn new(base_image: impl Into<String>, interpreter: impl Into<String>) -> Self {
        Self {
            resolver: DependencyResolver::new(),
            base_image: base_image.into(),
            interpreter: interpreter.into(),
        }
    }

    pub fn from_config(config: &SandboxConfig) -> Self {
        Self::new(config.base_image.clone(), config.interpreter.clone())
    }

    pub fn resolver(&self) -> &DependencyResolver {
        &self.resolver
    }

    pub fn interpreter(&self) -> &str {
        &self.interpreter
    }

    #[instrument(skip(self, code, mode), fields(dir = %dir.display()))]
    pub async fn prepare(&self, code: &str, mode: &PrepareMode, dir: &Path) -> Result<PreparedCode> {
        tokio::fs::create_dir_all(dir).await?;

        let fix = self.resolver.fix(code);
        if !fix.is_unchanged() {
            debug!(added = ?fix.added_imports, "added missing imports");
        }
        tokio::fs::write(dir.join(USER_CODE_FILE), &fix.fixed_code).await?;

        match mode {
            PrepareMode::Script { prelude } => {
                let prelude = prelude_literal(prelude)?;
                let runner = RUNNER.render(&[
                    ("USER_CODE_FILE", USER_CODE_FILE),
                    ("RESULT_FILE", RESULT_FILE),
                    ("PRELUDE", &prelude),
                ])?;
                tokio::fs::write(dir.join(RUNNER_FILE), runner).await?;
                tokio::fs::write(dir.join(DOCKERFILE), self.build_file(RUNNER_FILE, "", "")?).await?;

                Ok(PreparedCode {
                    dir: dir.to_path_buf(),
                    entry_file: RUNNER_FILE,
                    fix,
                    manifest: None,
                })
            }
            PrepareMode::Service { port, metadata } => {
                let used = self.resolver.detect_used_modules(&fix.fixed_code);
                let dependencies = self.resolver.requirements(&used);

                let metadata = serde_json::to_string(metadata)?;
                let port_text = port.to_string();
                let service = SERVICE.render(&[
                    ("USER_CODE_FILE", USER_CODE_FILE),
                    ("METADATA", &metadata),
                    ("PORT", &port_text),
                    ("DOCS_PATH", DOCS_PATH),
                ])?;
                tokio::fs::write(dir.join(SERVICE_FILE), service).await?;
                tokio::fs::write(dir.join(REQUIREMENTS_FILE), manifest::render(&dependencies)).await?;

                let install = if dependencies.is_empty() {
                    String::new()
                } else {
                    format!("RUN pip install --no-cache-dir -r {}", REQUIREMENTS_FILE)
                };
                let expose = format!("EXPOSE {}", port);
                tokio::fs::write(dir.join(DOCKERFILE), self.build_file(SERVICE_FILE, &install, &expose)?)
                    .await?;

                Ok(PreparedCode {
                    dir: dir.to_path_buf(),
                    entry_file: SERVICE_FILE,
                    fix,
                    manifest: Some(BuildManifest {
                        base_image: self.base_image.clone(),
                        port: *port,
                        dependencies,
                    }),
                })
            }
        }
    }

    fn build_file(&self, entry: &str, install: &str, expose: &str) -> Result<String> {
        BUILD_FILE.render(&[
            ("BASE_IMAGE", &self.base_image),
            ("WORKDIR", CONTAINER_WORKDIR),
            ("INSTALL", install),
            ("EXPOSE", expose),
            ("INTERPRETER", &self.interpreter),
            ("ENTRY", entry),
        ])
    }
}

/// `[["numpy", "np"], ...]`, which is also a valid Python literal.
fn prelude_literal(prelude: &[ImportSpec]) -> Result<String> {
    let pairs: Vec<[&str; 2]> = prelude
        .iter()
        .map(|spec| [spec.module.as_str(), spec.binding.as_str()])
        .collect();
    Ok(serde_json::to_string(&pairs)?)
}

/// Removes a sandbox directory; a missing directory counts as removed.
pub(crate) async fn remove_sandbox_dir(dir: &Path) -> bool {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => true,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => true,
        Err(err) => {
            warn!(dir = %dir.display(), error = %err, "sandbox directory removal failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn preparer() -> CodePreparer {
        CodePreparer::new("python:3.11-slim", "python")
    }

    #[tokio::test]
    async fn script_mode_writes_runner_and_fixed_code() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("sandbox");
        let mode = PrepareMode::Script { prelude: Vec::new() };

        let prepared = preparer().prepare("print(math.pi)\n", &mode, &dir).await.unwrap();
        assert_eq!(prepared.entry_file, RUNNER_FILE);
        assert_eq!(prepared.entry_path(), "/workspace/runner.py");
        assert!(prepared.manifest.is_none());

        let user_code = std::fs::read_to_string(dir.join(USER_CODE_FILE)).unwrap();
        assert_eq!(user_code, "import math\n\nprint(math.pi)\n");

        let runner = std::fs::read_to_string(dir.join(RUNNER_FILE)).unwrap();
        assert!(runner.contains("PRELUDE = []"));
        assert!(runner.contains("\"user_code.py\""));
        assert!(runner.contains("\"result.json\""));
        assert!(!runner.contains("{{"));

        let dockerfile = std::fs::read_to_string(dir.join(DOCKERFILE)).unwrap();
        assert!(dockerfile.starts_with("FROM python:3.11-slim"));
        assert!(dockerfile.contains("CMD [\"python\", \"/workspace/runner.py\"]"));
        assert!(!dockerfile.contains("EXPOSE"));
        assert!(!dir.join(REQUIREMENTS_FILE).exists());
    }

    #[tokio::test]
    async fn prelude_is_rendered_as_python_pairs() {
        let tmp = tempfile::tempdir().unwrap();
        let mode = PrepareMode::Script {
            prelude: vec![ImportSpec {
                module: "numpy".into(),
                binding: "np".into(),
            }],
        };
        preparer().prepare("print(1)\n", &mode, tmp.path()).await.unwrap();

        let runner = std::fs::read_to_string(tmp.path().join(RUNNER_FILE)).unwrap();
        assert!(runner.contains(r#"PRELUDE = [["numpy","np"]]"#));
    }

    #[tokio::test]
    async fn service_mode_writes_scaffold_manifest_and_build_file() {
        let tmp = tempfile::tempdir().unwrap();
        let code = "import yaml\n\n@endpoint('/add', 'POST', 'Adds')\ndef add(a: int, b: int):\n    return a + b\n";
        let mode = PrepareMode::Service {
            port: 8123,
            metadata: ServiceMetadata {
                name: "Test".into(),
                description: "adds \"numbers\"".into(),
                version: "1.0.0".into(),
            },
        };

        let prepared = preparer().prepare(code, &mode, tmp.path()).await.unwrap();
        assert_eq!(prepared.entry_file, SERVICE_FILE);
        assert_eq!(
            prepared.manifest,
            Some(BuildManifest {
                base_image: "python:3.11-slim".into(),
                port: 8123,
                dependencies: vec!["pyyaml".into()],
            })
        );

        let service = std::fs::read_to_string(tmp.path().join(SERVICE_FILE)).unwrap();
        assert!(service.contains(
            r#"METADATA = {"name":"Test","description":"adds \"numbers\"","version":"1.0.0"}"#
        ));
        assert!(service.contains(r#"PORT = int(os.environ.get("PORT", "8123"))"#));
        assert!(service.contains(r#"DOCS_PATH = "/api/docs""#));

        let requirements = std::fs::read_to_string(tmp.path().join(REQUIREMENTS_FILE)).unwrap();
        assert_eq!(requirements, "pyyaml\n");

        let dockerfile = std::fs::read_to_string(tmp.path().join(DOCKERFILE)).unwrap();
        assert!(dockerfile.contains("RUN pip install --no-cache-dir -r requirements.txt"));
        assert!(dockerfile.contains("EXPOSE 8123"));
        assert!(dockerfile.contains("CMD [\"python\", \"/workspace/service.py\"]"));
    }

    #[tokio::test]
    async fn removing_a_missing_directory_succeeds() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("gone");
        assert!(remove_sandbox_dir(&dir).await);
    }
}

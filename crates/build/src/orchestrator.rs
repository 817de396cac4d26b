use std::{
    collections::{BTreeSet, HashMap, HashSet},
    path::{Path, PathBuf},
    sync::Arc,
};

use log::{error, info, warn};
use tokio::{fs, sync::Semaphore, task::JoinHandle};

use crate::{
    base::BaseSource,
    depsolve::{resolve_batches, Batch, Node},
    error::{Error, Result},
    image::{BuildEnvironment, Image},
    progress::{BoundProgress, BuildProgress, BuildProgressContext},
    spec::{Spec, SpecFormat},
};

/// Specs grouped into batches that can be built one after another.
#[derive(Debug)]
pub struct BuildPlan {
    batches: Vec<Batch<Spec>>,
}

impl BuildPlan {
    /// Each spec depends on its base. External bases (templates, URLs and
    /// paths) get an anchor node named after the full base string, while a
    /// bare locator names another spec.
    pub fn new(specs: Vec<Spec>) -> Result<BuildPlan> {
        let mut anchors = BTreeSet::new();
        let mut nodes = Vec::with_capacity(specs.len());
        for spec in specs {
            let base = spec.base()?;
            let dependency = match base.source() {
                BaseSource::External => {
                    let name = base.to_string();
                    anchors.insert(name.clone());
                    name
                }
                BaseSource::Spec(id) => id,
            };
            nodes.push(Node::new(spec.id.clone(), Some(dependency), spec));
        }
        nodes.extend(anchors.into_iter().map(Node::anchor));
        Ok(BuildPlan {
            batches: resolve_batches(nodes)?,
        })
    }

    pub fn batches(&self) -> &[Batch<Spec>] {
        &self.batches
    }

    pub fn image_count(&self) -> usize {
        self.batches.iter().map(Batch::len).sum()
    }
}

#[derive(Debug)]
pub struct BuiltImage {
    pub artifact: PathBuf,
    pub virt_builder_entry: String,
}

#[derive(Debug)]
pub struct ImageOutcome {
    pub id: String,
    pub batch: usize,
    pub result: Result<BuiltImage>,
}

#[derive(Debug, Default)]
pub struct BuildReport {
    pub outcomes: Vec<ImageOutcome>,
}

impl BuildReport {
    pub fn succeeded(&self) -> impl Iterator<Item = (&str, &BuiltImage)> {
        self.outcomes.iter().filter_map(|outcome| {
            outcome
                .result
                .as_ref()
                .ok()
                .map(|built| (outcome.id.as_str(), built))
        })
    }

    pub fn failed(&self) -> impl Iterator<Item = (&str, &Error)> {
        self.outcomes.iter().filter_map(|outcome| {
            outcome
                .result
                .as_ref()
                .err()
                .map(|error| (outcome.id.as_str(), error))
        })
    }

    pub fn is_success(&self) -> bool {
        self.failed().next().is_none()
    }

    pub fn outcome(&self, id: &str) -> Option<&ImageOutcome> {
        self.outcomes.iter().find(|outcome| outcome.id == id)
    }

    /// virt-builder index blocks of every successful image, in build order.
    pub fn virt_builder_entries(&self) -> Vec<String> {
        self.succeeded()
            .map(|(_, built)| built.virt_builder_entry.clone())
            .collect()
    }
}

/// Builds a [`BuildPlan`] into a repository directory.
pub struct RepoBuilder {
    env: BuildEnvironment,
    repo_dir: PathBuf,
    jobs: usize,
    progress: BuildProgressContext,
}

impl RepoBuilder {
    pub fn new(
        env: BuildEnvironment,
        repo_dir: impl Into<PathBuf>,
        jobs: usize,
        progress: BuildProgressContext,
    ) -> RepoBuilder {
        RepoBuilder {
            env,
            repo_dir: repo_dir.into(),
            jobs: jobs.max(1),
            progress,
        }
    }

    pub fn repo_dir(&self) -> &Path {
        &self.repo_dir
    }

    /// Runs batches in order. Images inside a batch build concurrently, at
    /// most `jobs` at a time. A failed image fails everything built on it
    /// but leaves unrelated images alone.
    pub async fn build(&self, plan: BuildPlan) -> Result<BuildReport> {
        fs::create_dir_all(&self.repo_dir).await?;
        let mut artifacts: HashMap<String, PathBuf> = HashMap::new();
        let mut failed: HashSet<String> = HashSet::new();
        let mut report = BuildReport::default();

        for (index, batch) in plan.batches.into_iter().enumerate() {
            info!(
                "starting batch index={} images={}",
                index,
                batch.names().join(",")
            );
            let semaphore = Arc::new(Semaphore::new(self.jobs));
            let mut tasks: Vec<(String, JoinHandle<Result<BuiltImage>>)> = Vec::new();

            for spec in batch.nodes.into_iter().filter_map(|node| node.payload) {
                let id = spec.id.clone();
                match self.prepare(spec, &artifacts, &failed) {
                    Ok(image) => {
                        let task = self.spawn(image, semaphore.clone());
                        tasks.push((id, task));
                    }
                    Err(error) => {
                        warn!("skipping image id={}: {}", id, error);
                        failed.insert(id.clone());
                        report.outcomes.push(ImageOutcome {
                            id,
                            batch: index,
                            result: Err(error),
                        });
                    }
                }
            }

            for (id, task) in tasks {
                let result = match task.await {
                    Ok(result) => result,
                    Err(error) => Err(Error::from(error)),
                };
                match &result {
                    Ok(built) => {
                        artifacts.insert(id.clone(), built.artifact.clone());
                    }
                    Err(error) => {
                        error!("image failed id={}: {}", id, error);
                        failed.insert(id.clone());
                    }
                }
                report.outcomes.push(ImageOutcome {
                    id,
                    batch: index,
                    result,
                });
            }
        }

        Ok(report)
    }

    /// Creates the image and rewrites a spec-id base to the finalized
    /// artifact of that spec.
    fn prepare(
        &self,
        spec: Spec,
        artifacts: &HashMap<String, PathBuf>,
        failed: &HashSet<String>,
    ) -> Result<Image> {
        let source = spec.base()?.source();
        let mut image = Image::new(spec, &self.repo_dir)?;
        if let BaseSource::Spec(dependency) = source {
            if failed.contains(&dependency) {
                return Err(Error::DependencyFailed(dependency));
            }
            if let Some(artifact) = artifacts.get(&dependency) {
                info!(
                    "rewriting base id={} dependency={} artifact={}",
                    image.id(),
                    dependency,
                    artifact.display()
                );
                image.set_base_locator(artifact.to_string_lossy());
            }
        }
        Ok(image)
    }

    fn spawn(&self, mut image: Image, semaphore: Arc<Semaphore>) -> JoinHandle<Result<BuiltImage>> {
        let env = self.env.clone();
        let progress = BoundProgress::new(self.progress.clone(), BuildProgress::new(image.id()));
        tokio::task::spawn(async move {
            progress.update(|_| {}).await;
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|error| Error::Io(std::io::Error::other(error)))?;
            info!("image task started id={}", image.id());
            let result = image.run(&env, &progress).await;
            let artifact = match result {
                Ok(artifact) => artifact,
                Err(error) => {
                    let message = error.to_string();
                    progress.update(|progress| progress.fail(&message)).await;
                    return Err(error);
                }
            };
            Ok(BuiltImage {
                artifact,
                virt_builder_entry: image.libguestfs_metadata()?,
            })
        })
    }
}

/// Expands directories to the regular files directly inside them, sorted.
/// Other paths are kept as given.
pub async fn resolve_spec_paths(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut resolved = Vec::new();
    for path in paths {
        if !fs::metadata(path).await?.is_dir() {
            resolved.push(path.clone());
            continue;
        }
        let mut entries = fs::read_dir(path).await?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                files.push(entry.path());
            }
        }
        files.sort();
        resolved.extend(files);
    }
    Ok(resolved)
}

pub async fn load_specs(paths: &[PathBuf], format: SpecFormat) -> Result<Vec<Spec>> {
    let mut specs = Vec::new();
    for path in resolve_spec_paths(paths).await? {
        specs.push(Spec::load(&path, format).await?);
    }
    Ok(specs)
}

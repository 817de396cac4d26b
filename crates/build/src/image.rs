use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

use log::{debug, info};
use tokio::fs;

use crate::{
    acquire::BaseAcquirer,
    base::{BaseReference, StrategyTag},
    compress::{with_suffix, xz_compress, CompressionOptions},
    digest::file_digests,
    error::{BuildStage, Error, Result},
    metadata::{sidecar_paths, ImageMetadata},
    progress::BoundProgress,
    spec::Spec,
    tools::DiskTools,
};

pub const WORK_DIR_NAME: &str = ".work";
const PARTIAL_EXTENSION: &str = "partial";

/// How the disk for an image is produced, chosen by the tag of its base.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BuildStrategy {
    /// Generate a fresh disk from a named virt-builder template.
    Generator { template: String },
    /// Overlay a new qcow2 on top of an acquired backing image.
    Layered { base: String },
    /// Acquire the base as the image itself and optionally customize it.
    Simple { base: String, metadata_only: bool },
}

impl BuildStrategy {
    pub fn from_base(base: &BaseReference, metadata_only: bool) -> BuildStrategy {
        let locator = base.locator.clone();
        match base.tag {
            StrategyTag::Libguestfs => BuildStrategy::Generator { template: locator },
            StrategyTag::Layer => BuildStrategy::Layered { base: locator },
            StrategyTag::Simple => BuildStrategy::Simple {
                base: locator,
                metadata_only,
            },
        }
    }

    pub fn locator(&self) -> &str {
        match self {
            BuildStrategy::Generator { template } => template,
            BuildStrategy::Layered { base } => base,
            BuildStrategy::Simple { base, .. } => base,
        }
    }

    pub fn tag(&self) -> StrategyTag {
        match self {
            BuildStrategy::Generator { .. } => StrategyTag::Libguestfs,
            BuildStrategy::Layered { .. } => StrategyTag::Layer,
            BuildStrategy::Simple { .. } => StrategyTag::Simple,
        }
    }
}

impl fmt::Display for BuildStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tag().as_str(), self.locator())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ImageState {
    Unbuilt,
    Built,
    Compressed,
    Finalized,
}

/// Everything an image build needs from the outside world.
#[derive(Clone)]
pub struct BuildEnvironment {
    pub tools: Arc<dyn DiskTools>,
    pub acquirer: BaseAcquirer,
    pub compression: CompressionOptions,
}

pub struct Image {
    pub spec: Spec,
    destination_path: PathBuf,
    work_dir: PathBuf,
    strategy: BuildStrategy,
    state: ImageState,
    compressed: bool,
    built_image_path: Option<PathBuf>,
}

impl Image {
    pub fn new(spec: Spec, repo_dir: &Path) -> Result<Image> {
        let base = spec.base()?;
        let strategy = BuildStrategy::from_base(&base, spec.properties.meta_data_only);
        debug!("selected strategy id={} strategy={}", spec.id, strategy);
        Ok(Image {
            destination_path: repo_dir.join(&spec.id),
            work_dir: repo_dir.join(WORK_DIR_NAME).join(&spec.id),
            spec,
            strategy,
            state: ImageState::Unbuilt,
            compressed: false,
            built_image_path: None,
        })
    }

    pub fn id(&self) -> &str {
        &self.spec.id
    }

    pub fn strategy(&self) -> &BuildStrategy {
        &self.strategy
    }

    pub fn state(&self) -> ImageState {
        self.state
    }

    pub fn is_built(&self) -> bool {
        self.state >= ImageState::Built
    }

    /// Finalizing does not imply compression, so this is tracked apart
    /// from the state.
    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    pub fn destination_path(&self) -> &Path {
        &self.destination_path
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn built_image_path(&self) -> Option<&Path> {
        self.built_image_path.as_deref()
    }

    /// Points the base of a layered or simple image at `locator`. Generator
    /// templates are names, not artifacts, and are left alone.
    pub fn set_base_locator(&mut self, locator: impl Into<String>) {
        match &mut self.strategy {
            BuildStrategy::Generator { .. } => {}
            BuildStrategy::Layered { base } | BuildStrategy::Simple { base, .. } => {
                *base = locator.into();
            }
        }
    }

    fn built_path(&self) -> Result<&Path> {
        match (self.is_built(), self.built_image_path.as_deref()) {
            (true, Some(path)) => Ok(path),
            _ => Err(Error::ImageNotBuilt(self.spec.id.clone())),
        }
    }

    async fn custom_build_action(
        &self,
        env: &BuildEnvironment,
        progress: &BoundProgress,
    ) -> Result<PathBuf> {
        let id = self.spec.id.as_str();
        let commands = self.spec.commands_file.as_path();
        let tools = env.tools.as_ref();
        match &self.strategy {
            BuildStrategy::Generator { template } => {
                let dst = self.destination_path.as_path();
                transform(progress, "virt-builder", tools.generate(template, dst, commands))
                    .await
                    .map_err(|error| error.at(id, BuildStage::Transform))?;
                clean(tools, dst, progress)
                    .await
                    .map_err(|error| error.at(id, BuildStage::Transform))?;
                Ok(dst.to_path_buf())
            }

            BuildStrategy::Layered { base } => {
                let backing = async {
                    fs::create_dir_all(&self.work_dir).await?;
                    let acquired = env.acquirer.acquire(base, &self.work_dir, progress).await?;
                    Ok::<PathBuf, Error>(fs::canonicalize(acquired).await?)
                }
                .await
                .map_err(|error| error.at(id, BuildStage::Acquire))?;

                let dst = self.destination_path.as_path();
                async {
                    transform(progress, "qemu-img", tools.create_layered(&backing, dst)).await?;
                    transform(progress, "virt-customize", tools.customize(dst, commands)).await?;
                    clean(tools, dst, progress).await
                }
                .await
                .map_err(|error| error.at(id, BuildStage::Transform))?;
                Ok(dst.to_path_buf())
            }

            BuildStrategy::Simple {
                base,
                metadata_only,
            } => {
                let acquired = env
                    .acquirer
                    .acquire(base, &self.destination_path, progress)
                    .await
                    .map_err(|error| error.at(id, BuildStage::Acquire))?;
                if *metadata_only {
                    info!("metadata only, skipping customization id={}", id);
                    return Ok(acquired);
                }
                async {
                    transform(progress, "virt-customize", tools.customize(&acquired, commands))
                        .await?;
                    clean(tools, &acquired, progress).await
                }
                .await
                .map_err(|error| error.at(id, BuildStage::Transform))?;
                Ok(acquired)
            }
        }
    }

    /// Runs the strategy, checks its artifact and records the uncompressed
    /// size and digests. A built image is returned as is.
    pub async fn build(
        &mut self,
        env: &BuildEnvironment,
        progress: &BoundProgress,
    ) -> Result<PathBuf> {
        if self.is_built() {
            return Ok(self.built_path()?.to_path_buf());
        }

        info!("building image id={} strategy={}", self.spec.id, self.strategy);
        let path = self.custom_build_action(env, progress).await?;
        let size = match fs::metadata(&path).await {
            Ok(metadata) if metadata.is_file() => metadata.len(),
            _ => 0,
        };
        if size == 0 {
            return Err(Error::ArtifactMissing(path).at(&self.spec.id, BuildStage::Verify));
        }

        progress.update(|progress| progress.start_hashing()).await;
        let digests = file_digests(&path)
            .await
            .map_err(|error| error.at(&self.spec.id, BuildStage::Hash))?;
        self.spec
            .build
            .record_uncompressed(digests.size, digests.sha1, digests.sha512)
            .map_err(|error| error.at(&self.spec.id, BuildStage::Hash))?;
        self.state = ImageState::Built;
        self.built_image_path = Some(path.clone());
        Ok(path)
    }

    /// Compresses the built artifact to `<artifact>.xz` and removes the
    /// uncompressed file. Calling it again returns the same path. An image
    /// finalized uncompressed stays that way.
    pub async fn compress(
        &mut self,
        options: CompressionOptions,
        progress: Option<&BoundProgress>,
    ) -> Result<PathBuf> {
        let path = self.built_path()?.to_path_buf();
        if self.is_compressed() {
            info!("already compressed id={}", self.spec.id);
            return Ok(path);
        }
        if self.state == ImageState::Finalized {
            return Err(Error::ImageFinalized(self.spec.id.clone()));
        }

        if let Some(progress) = progress {
            let size = self.spec.build.size.unwrap_or(0);
            progress
                .update(|progress| progress.start_compressing(size))
                .await;
        }
        let compressed = xz_compress(&path, options, progress.cloned()).await?;
        fs::remove_file(&path).await?;
        self.built_image_path = Some(compressed.clone());
        self.compressed = true;
        self.state = ImageState::Compressed;
        Ok(compressed)
    }

    /// Records the compressed size and digests plus the build timestamp.
    pub async fn record_post_compress(&mut self) -> Result<()> {
        if !self.is_compressed() {
            return Err(Error::ImageNotCompressed(self.spec.id.clone()));
        }
        let path = self.built_path()?.to_path_buf();
        let digests = file_digests(&path).await?;
        self.spec.build.record_compressed(
            digests.size,
            digests.sha1,
            digests.sha512,
            chrono::Utc::now().timestamp(),
        )
    }

    /// Writes `<dst>.hash` and then `<dst>.metadata` next to the artifact.
    /// The metadata file is renamed into place last, so its presence means
    /// both sidecars are complete.
    pub async fn write_metadata(&mut self) -> Result<(PathBuf, PathBuf)> {
        if self.state == ImageState::Finalized {
            return Err(Error::ImageFinalized(self.spec.id.clone()));
        }
        let artifact = self.built_path()?;
        let (metadata_path, hash_path) = sidecar_paths(artifact);
        let sha1 = self
            .spec
            .build
            .sha1
            .clone()
            .ok_or_else(|| Error::ImageNotBuilt(self.spec.id.clone()))?;

        debug!(
            "writing metadata id={} metadata={} hash={}",
            self.spec.id,
            metadata_path.display(),
            hash_path.display()
        );
        let metadata = ImageMetadata::from_spec(&self.spec).to_json()?;
        fs::write(&hash_path, sha1).await?;
        let partial = with_suffix(&metadata_path, PARTIAL_EXTENSION);
        let written = match fs::write(&partial, metadata).await {
            Ok(()) => fs::rename(&partial, &metadata_path).await,
            Err(error) => Err(error),
        };
        if let Err(error) = written {
            let _ = fs::remove_file(&partial).await;
            return Err(error.into());
        }
        self.state = ImageState::Finalized;
        Ok((metadata_path, hash_path))
    }

    /// The virt-builder index block for this image.
    pub fn libguestfs_metadata(&self) -> Result<String> {
        if !self.is_compressed() {
            return Err(Error::ImageNotCompressed(self.spec.id.clone()));
        }
        let artifact = self.built_path()?;
        let file = artifact
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .ok_or_else(|| Error::ArtifactMissing(artifact.to_path_buf()))?;
        ImageMetadata::from_spec(&self.spec).virt_builder_entry(&self.spec.id, &file)
    }

    /// Drives the image from unbuilt to finalized and returns the path of
    /// the compressed artifact.
    pub async fn run(&mut self, env: &BuildEnvironment, progress: &BoundProgress) -> Result<PathBuf> {
        let id = self.spec.id.clone();
        self.build(env, progress).await?;
        let artifact = self
            .compress(env.compression, Some(progress))
            .await
            .map_err(|error| error.at(&id, BuildStage::Compress))?;
        progress.update(|progress| progress.start_hashing()).await;
        self.record_post_compress()
            .await
            .map_err(|error| error.at(&id, BuildStage::Hash))?;
        self.write_metadata()
            .await
            .map_err(|error| error.at(&id, BuildStage::Metadata))?;

        let size = self.spec.build.compressed_size.unwrap_or(0);
        progress.update(|progress| progress.complete(size)).await;
        info!("finalized image id={} artifact={}", id, artifact.display());
        Ok(artifact)
    }
}

async fn transform(
    progress: &BoundProgress,
    tool: &str,
    task: impl std::future::Future<Output = Result<()>>,
) -> Result<()> {
    progress.update(|progress| progress.start_transform(tool)).await;
    task.await
}

async fn clean(tools: &dyn DiskTools, image: &Path, progress: &BoundProgress) -> Result<()> {
    transform(progress, "virt-sysprep", tools.sysprep(image)).await?;
    transform(progress, "virt-sparsify", tools.sparsify(image)).await
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        acquire::AcquireOptions,
        progress::{BuildProgress, BuildProgressContext},
        spec::{SpecFormat, SpecProperties},
    };

    struct NoTools;

    #[async_trait::async_trait]
    impl DiskTools for NoTools {
        async fn generate(&self, _: &str, _: &Path, _: &Path) -> Result<()> {
            panic!("generate should not run");
        }
        async fn create_layered(&self, _: &Path, _: &Path) -> Result<()> {
            panic!("create_layered should not run");
        }
        async fn customize(&self, _: &Path, _: &Path) -> Result<()> {
            panic!("customize should not run");
        }
        async fn sysprep(&self, _: &Path) -> Result<()> {
            panic!("sysprep should not run");
        }
        async fn sparsify(&self, _: &Path) -> Result<()> {
            panic!("sparsify should not run");
        }
    }

    fn environment() -> BuildEnvironment {
        BuildEnvironment {
            tools: Arc::new(NoTools),
            acquirer: BaseAcquirer::new(AcquireOptions::default()),
            compression: CompressionOptions {
                preset: 1,
                ..Default::default()
            },
        }
    }

    fn progress() -> BoundProgress {
        let (context, _) = BuildProgressContext::create();
        BoundProgress::new(context, BuildProgress::new("test"))
    }

    fn metadata_only_image(dir: &Path) -> Image {
        let source = dir.join("source.qcow2");
        std::fs::write(&source, b"prebuilt disk image").unwrap();
        let mut properties = SpecProperties::default();
        properties.set("name", "el7".to_string());
        properties.set("distro", "el7".to_string());
        properties.set("base", format!("simple:{}", source.display()));
        properties.set("meta_data_only", "true".to_string());
        let spec = Spec::new("el7", dir.join("el7.spec"), properties, SpecFormat::Lago).unwrap();
        let repo = dir.join("repo");
        std::fs::create_dir_all(&repo).unwrap();
        Image::new(spec, &repo).unwrap()
    }

    #[test]
    fn test_strategy_from_base() {
        let base = BaseReference::parse("libguestfs:fedora-23").unwrap();
        assert_eq!(
            BuildStrategy::from_base(&base, true),
            BuildStrategy::Generator {
                template: "fedora-23".to_string()
            }
        );
        let base = BaseReference::parse("simple:/images/el7").unwrap();
        assert_eq!(
            BuildStrategy::from_base(&base, true),
            BuildStrategy::Simple {
                base: "/images/el7".to_string(),
                metadata_only: true
            }
        );
    }

    #[tokio::test]
    async fn test_operations_require_build() {
        let dir = tempfile::tempdir().unwrap();
        let mut image = metadata_only_image(dir.path());
        assert!(matches!(
            image.compress(CompressionOptions::default(), None).await,
            Err(Error::ImageNotBuilt(id)) if id == "el7"
        ));
        assert!(matches!(
            image.write_metadata().await,
            Err(Error::ImageNotBuilt(_))
        ));
        assert!(matches!(
            image.libguestfs_metadata(),
            Err(Error::ImageNotCompressed(_))
        ));
        assert!(matches!(
            image.record_post_compress().await,
            Err(Error::ImageNotCompressed(_))
        ));
        assert_eq!(image.state(), ImageState::Unbuilt);
    }

    #[tokio::test]
    async fn test_compress_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let env = environment();
        let mut image = metadata_only_image(dir.path());
        let built = image.build(&env, &progress()).await.unwrap();
        assert_eq!(built, image.destination_path());
        assert!(image.is_built());
        assert_eq!(image.spec.build.size, Some(19));

        let first = image.compress(env.compression, None).await.unwrap();
        assert!(!built.exists());
        let modified = std::fs::metadata(&first).unwrap().modified().unwrap();
        let second = image.compress(env.compression, None).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(
            std::fs::metadata(&second).unwrap().modified().unwrap(),
            modified
        );
        assert_eq!(image.state(), ImageState::Compressed);
    }

    #[tokio::test]
    async fn test_run_finalizes_metadata_only_image() {
        let dir = tempfile::tempdir().unwrap();
        let env = environment();
        let mut image = metadata_only_image(dir.path());
        let artifact = image.run(&env, &progress()).await.unwrap();
        assert_eq!(artifact, dir.path().join("repo").join("el7.xz"));
        assert_eq!(image.state(), ImageState::Finalized);

        let hash = std::fs::read_to_string(dir.path().join("repo/el7.hash")).unwrap();
        assert_eq!(Some(hash), image.spec.build.sha1);
        let metadata = ImageMetadata::load(&dir.path().join("repo/el7.metadata"))
            .await
            .unwrap();
        assert_eq!(metadata.size, Some(19));
        assert!(metadata.checksum.is_some());
        assert!(image.libguestfs_metadata().unwrap().starts_with("[el7]\nfile=el7.xz\n"));
        assert!(matches!(
            image.write_metadata().await,
            Err(Error::ImageFinalized(_))
        ));
    }

    #[tokio::test]
    async fn test_empty_artifact_fails_verification() {
        let dir = tempfile::tempdir().unwrap();
        let env = environment();
        let mut image = metadata_only_image(dir.path());
        std::fs::write(dir.path().join("source.qcow2"), b"").unwrap();
        let error = image.build(&env, &progress()).await.unwrap_err();
        assert_eq!(error.stage(), Some(BuildStage::Verify));
        assert!(!image.is_built());
    }

    #[tokio::test]
    async fn test_failed_hashing_leaves_image_unbuilt() {
        let dir = tempfile::tempdir().unwrap();
        let env = environment();
        let mut image = metadata_only_image(dir.path());
        image
            .spec
            .build
            .record_uncompressed(1, "a".to_string(), "b".to_string())
            .unwrap();
        let error = image.build(&env, &progress()).await.unwrap_err();
        assert_eq!(error.stage(), Some(BuildStage::Hash));
        assert!(!image.is_built());
        assert_eq!(image.state(), ImageState::Unbuilt);
        assert!(image.built_image_path().is_none());
    }

    #[tokio::test]
    async fn test_compress_after_metadata_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let env = environment();
        let mut image = metadata_only_image(dir.path());
        let built = image.build(&env, &progress()).await.unwrap();
        image.write_metadata().await.unwrap();
        assert_eq!(image.state(), ImageState::Finalized);
        assert!(!image.is_compressed());

        assert!(matches!(
            image.compress(env.compression, None).await,
            Err(Error::ImageFinalized(id)) if id == "el7"
        ));
        assert!(built.is_file());
        assert!(!dir.path().join("repo/el7.xz").exists());
        assert!(!image.is_compressed());
        assert!(matches!(
            image.libguestfs_metadata(),
            Err(Error::ImageNotCompressed(_))
        ));
    }

    #[tokio::test]
    async fn test_metadata_is_not_published_when_hash_write_fails() {
        let dir = tempfile::tempdir().unwrap();
        let env = environment();
        let mut image = metadata_only_image(dir.path());
        image.build(&env, &progress()).await.unwrap();
        image.compress(env.compression, None).await.unwrap();
        image.record_post_compress().await.unwrap();

        let hash = dir.path().join("repo/el7.hash");
        let metadata = dir.path().join("repo/el7.metadata");
        std::fs::create_dir(&hash).unwrap();
        assert!(image.write_metadata().await.is_err());
        assert!(!metadata.exists());
        assert!(!dir.path().join("repo/el7.metadata.partial").exists());
        assert_eq!(image.state(), ImageState::Compressed);

        std::fs::remove_dir(&hash).unwrap();
        let (written, _) = image.write_metadata().await.unwrap();
        assert_eq!(written, metadata);
        assert_eq!(
            Some(std::fs::read_to_string(&hash).unwrap()),
            image.spec.build.sha1
        );
        assert_eq!(image.state(), ImageState::Finalized);
    }
}

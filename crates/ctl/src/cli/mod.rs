use std::{path::PathBuf, sync::Arc};

use anyhow::{anyhow, Result};
use clap::{Parser, ValueEnum};
use log::info;
use tokio::fs;
use vmrepobuild::{
    acquire::BaseAcquirer,
    config::BuildConfig,
    image::BuildEnvironment,
    orchestrator::{load_specs, BuildPlan, BuildReport, RepoBuilder},
    progress::BuildProgressContext,
    spec::SpecFormat,
    tools::LibguestfsTools,
};
use vmrepoindex::{lago::LagoRepoIndex, virt_builder::VirtBuilderIndex};

use crate::{
    format::{plan_table, report_table},
    progress::render_build_progress,
};

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum RepoFormat {
    VirtBuilder,
    Lago,
    All,
}

impl From<RepoFormat> for SpecFormat {
    fn from(format: RepoFormat) -> Self {
        match format {
            RepoFormat::VirtBuilder => SpecFormat::VirtBuilder,
            RepoFormat::Lago => SpecFormat::Lago,
            RepoFormat::All => SpecFormat::All,
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    version,
    about = "Build a repository of virtual machine disk image templates"
)]
pub struct BuildRepoCommand {
    #[arg(
        short = 'f',
        long,
        value_enum,
        default_value = "all",
        help = "Repository format to validate specs against and generate"
    )]
    pub repo_format: RepoFormat,
    #[arg(
        short,
        long,
        default_value = "./image-specs",
        help = "Spec file or directory of spec files, may be repeated"
    )]
    pub specs: Vec<PathBuf>,
    #[arg(
        short = 'o',
        long,
        default_value = "./image-repo",
        help = "Directory to write images and indexes to"
    )]
    pub repo_dir: PathBuf,
    #[arg(
        long,
        default_value = "http://127.0.0.1:8181",
        help = "URL the repository will be served from"
    )]
    pub base_url: String,
    #[arg(long, default_value = "test", help = "Name of the repository")]
    pub repo_name: String,
    #[arg(
        long,
        help = "Skip building and regenerate the indexes from existing metadata"
    )]
    pub create_repo_only: bool,
    #[arg(long, help = "Print the build plan without building anything")]
    pub dry_run: bool,
    #[arg(short, long, help = "Maximum number of images built at the same time")]
    pub jobs: Option<usize>,
    #[arg(long, help = "Timeout in seconds for each external tool invocation")]
    pub tool_timeout: Option<u64>,
    #[arg(short, long, help = "Path to a TOML build configuration")]
    pub config: Option<PathBuf>,
    #[arg(long, help = "Disable progress bars")]
    pub no_progress: bool,
}

impl BuildRepoCommand {
    pub async fn run(self) -> Result<()> {
        let format = SpecFormat::from(self.repo_format);
        if self.create_repo_only {
            return self.write_indexes(format, None).await;
        }

        let config = self.config().await?;
        let specs = load_specs(&self.specs, format).await?;
        info!("loaded specs count={}", specs.len());
        let plan = BuildPlan::new(specs)?;
        if self.dry_run {
            println!("{}", plan_table(&plan));
            return Ok(());
        }

        let env = BuildEnvironment {
            tools: Arc::new(LibguestfsTools::new(config.tools.clone())),
            acquirer: BaseAcquirer::new(config.download.clone()),
            compression: config.compression,
        };
        let (context, receiver) = BuildProgressContext::create();
        let renderer = if self.no_progress {
            drop(receiver);
            None
        } else {
            Some(tokio::task::spawn(render_build_progress(receiver)))
        };

        let report = {
            let builder = RepoBuilder::new(env, &self.repo_dir, config.build.jobs(), context);
            builder.build(plan).await?
        };
        if let Some(renderer) = renderer {
            renderer.await??;
        }

        self.write_indexes(format, Some(&report)).await?;
        println!("{}", report_table(&report));

        let failed = report.failed().count();
        if failed > 0 {
            return Err(anyhow!(
                "{} of {} images failed to build",
                failed,
                report.outcomes.len()
            ));
        }
        Ok(())
    }

    /// Loads the configuration file, if any, and applies flag overrides.
    pub async fn config(&self) -> Result<BuildConfig> {
        let mut config = match self.config {
            Some(ref path) => BuildConfig::load(path).await?,
            None => BuildConfig::default(),
        };
        if let Some(jobs) = self.jobs {
            config.build.jobs = Some(jobs);
        }
        if let Some(timeout) = self.tool_timeout {
            config.tools.timeout = timeout;
        }
        Ok(config)
    }

    async fn write_indexes(&self, format: SpecFormat, report: Option<&BuildReport>) -> Result<()> {
        fs::create_dir_all(&self.repo_dir).await?;
        if format.includes_lago() {
            let index =
                LagoRepoIndex::from_metadata_dir(&self.repo_dir, &self.repo_name, &self.base_url)
                    .await?;
            let path = index.write(&self.repo_dir).await?;
            info!(
                "wrote lago index path={} templates={}",
                path.display(),
                index.templates.len()
            );
        }
        if format.includes_virt_builder() {
            let index = match report {
                Some(report) => VirtBuilderIndex::from_entries(report.virt_builder_entries()),
                None => VirtBuilderIndex::from_metadata_dir(&self.repo_dir).await?,
            };
            let path = index.write(&self.repo_dir).await?;
            info!(
                "wrote virt-builder index path={} images={}",
                path.display(),
                index.len()
            );
        }
        Ok(())
    }
}

//! First-use provisioning of metric tools & models.
use crate::{
    process::{CommandExt, ensure_success},
    scorer::ScoreError,
};
use anyhow::{Context, ensure};
use futures_util::{FutureExt, future::LocalBoxFuture};
use log::{debug, info};
use std::{
    collections::HashMap,
    hash::Hash,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};
use tokio::process::Command;

const READY_MARKER: &str = ".ready";

/// How a mode becomes ready to run.
#[derive(Debug, Clone, Copy, Hash)]
pub enum Provision {
    /// Nothing to do.
    None,
    /// An external tool that must be installed.
    Tool(ToolCheck),
    /// A model repository with weights run inside its own python venv.
    Model(&'static ModelRecipe),
}

impl Provision {
    pub fn label(&self) -> &'static str {
        match self {
            Self::None => "-",
            Self::Tool(tool) => tool.program,
            Self::Model(recipe) => recipe.name,
        }
    }
}

/// Run `program args` and expect its stdout or stderr to contain `expect`.
#[derive(Debug, Clone, Copy, Hash)]
pub struct ToolCheck {
    pub program: &'static str,
    pub args: &'static [&'static str],
    pub expect: &'static str,
}

#[derive(Debug, Hash)]
pub struct ModelRecipe {
    /// Install dir name under `<toolkit>/models`, shared by modes using the same model.
    pub name: &'static str,
    /// Cloned as the install dir. Without one the install dir only holds the venv & runners.
    pub repo: Option<&'static str>,
    /// More repositories `(dir relative to the install dir, url)`.
    pub extra_repos: &'static [(&'static str, &'static str)],
    /// Source edits applied once after cloning.
    pub patches: &'static [Patch],
    /// `(path relative to the install dir, url)`
    pub weights: &'static [(&'static str, &'static str)],
    /// Interpreter used to create the venv.
    pub python: &'static str,
    /// Requirement files relative to the install dir.
    pub requirements: &'static [&'static str],
    pub packages: &'static [&'static str],
    /// Dirs relative to the install dir pip installed as editable packages.
    pub editable: &'static [&'static str],
    /// vqcheck runner scripts written into the install dir.
    pub runners: &'static [Runner],
    /// Upstream files a runnable install must contain, relative to the install dir.
    pub required: &'static [&'static str],
}

impl ModelRecipe {
    pub const EMPTY: Self = Self {
        name: "",
        repo: None,
        extra_repos: &[],
        patches: &[],
        weights: &[],
        python: "python3",
        requirements: &[],
        packages: &[],
        editable: &[],
        runners: &[],
        required: &[],
    };

    pub fn install_dir(&self, toolkit: &Path) -> PathBuf {
        toolkit.join("models").join(self.name)
    }

    pub fn python_bin(&self, toolkit: &Path) -> PathBuf {
        let venv = self.install_dir(toolkit).join("venv");
        match cfg!(windows) {
            true => venv.join("Scripts").join("python.exe"),
            false => venv.join("bin").join("python"),
        }
    }

    /// Runner, weight & required files not present in the install dir.
    pub async fn missing_files(&self, toolkit: &Path) -> Vec<PathBuf> {
        let dir = self.install_dir(toolkit);
        let mut missing = vec![];
        let files = self
            .runners
            .iter()
            .map(|r| r.file)
            .chain(self.weights.iter().map(|(path, _)| *path))
            .chain(self.required.iter().copied());
        for file in files {
            let path = dir.join(file);
            if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
                missing.push(path);
            }
        }
        missing
    }
}

/// Replace `find` with `replace` in `file`, relative to the install dir.
#[derive(Debug, Hash)]
pub struct Patch {
    pub file: &'static str,
    pub find: &'static str,
    pub replace: &'static str,
    /// Replace every occurrence, otherwise only the first.
    pub all: bool,
}

impl Patch {
    pub const fn first(file: &'static str, find: &'static str, replace: &'static str) -> Self {
        Self {
            file,
            find,
            replace,
            all: false,
        }
    }

    pub const fn all(file: &'static str, find: &'static str, replace: &'static str) -> Self {
        Self {
            file,
            find,
            replace,
            all: true,
        }
    }

    fn apply(&self, source: &str) -> anyhow::Result<String> {
        ensure!(
            source.contains(self.find),
            "{}: `{}` not found",
            self.file,
            self.find
        );
        Ok(match self.all {
            true => source.replace(self.find, self.replace),
            false => source.replacen(self.find, self.replace, 1),
        })
    }
}

/// A script shipped with vqcheck.
#[derive(Debug, Hash)]
pub struct Runner {
    pub file: &'static str,
    pub source: &'static str,
}

/// Performs the actual fetch/build/check work for a [`Provision`].
pub trait ProvisionHook {
    fn provision<'a>(
        &'a self,
        provision: &'a Provision,
        toolkit: &'a Path,
    ) -> LocalBoxFuture<'a, anyhow::Result<()>>;
}

/// Provisions using `git`, `curl` & python venvs.
#[derive(Debug, Default)]
pub struct External;

impl ProvisionHook for External {
    fn provision<'a>(
        &'a self,
        provision: &'a Provision,
        toolkit: &'a Path,
    ) -> LocalBoxFuture<'a, anyhow::Result<()>> {
        async move {
            match provision {
                Provision::None => Ok(()),
                Provision::Tool(tool) => check_tool(tool).await,
                Provision::Model(recipe) => install_model(recipe, toolkit).await,
            }
        }
        .boxed_local()
    }
}

async fn check_tool(tool: &ToolCheck) -> anyhow::Result<()> {
    let out = Command::new(tool.program)
        .args(tool.args)
        .kill_on_drop(true)
        .output()
        .await
        .with_context(|| format!("{} not found", tool.program))?;
    let stdout = String::from_utf8_lossy(&out.stdout);
    let stderr = String::from_utf8_lossy(&out.stderr);
    ensure!(
        stdout.contains(tool.expect) || stderr.contains(tool.expect),
        "{} missing `{}`, exit code {:?}",
        tool.program,
        tool.expect,
        out.status.code(),
    );
    Ok(())
}

async fn run(mut cmd: Command, name: &str) -> anyhow::Result<()> {
    cmd.kill_on_drop(true);
    let cmd_str = cmd.to_cmd_str();
    debug!("cmd `{cmd_str}`");
    let out = cmd.output().await.with_context(|| format!("{name}: {cmd_str}"))?;
    ensure_success(name, &out)
}

async fn git_clone(url: &str, dest: &Path) -> anyhow::Result<()> {
    info!("cloning {url}");
    let mut git = Command::new("git");
    git.arg("clone").arg2("--depth", "1").arg(url).arg(dest);
    run(git, "git").await
}

async fn apply_patches(dir: &Path, patches: &[Patch]) -> anyhow::Result<()> {
    for patch in patches {
        let path = dir.join(patch.file);
        let source = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        tokio::fs::write(&path, patch.apply(&source)?)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
    }
    Ok(())
}

async fn install_model(recipe: &ModelRecipe, toolkit: &Path) -> anyhow::Result<()> {
    let dir = recipe.install_dir(toolkit);

    let mut cloned = false;
    if let Some(repo) = recipe.repo {
        if !tokio::fs::try_exists(dir.join(".git")).await? {
            git_clone(repo, &dir).await?;
            cloned = true;
        }
    } else {
        tokio::fs::create_dir_all(&dir).await?;
    }
    for (sub, url) in recipe.extra_repos {
        if !tokio::fs::try_exists(dir.join(sub).join(".git")).await? {
            git_clone(url, &dir.join(sub)).await?;
            cloned = true;
        }
    }
    if cloned {
        if let Err(err) = apply_patches(&dir, recipe.patches).await {
            // reclone next time rather than run half patched sources
            _ = tokio::fs::remove_dir_all(&dir).await;
            return Err(err.context("patching sources"));
        }
    }

    for (path, url) in recipe.weights {
        let dest = dir.join(path);
        if tokio::fs::try_exists(&dest).await? {
            continue;
        }
        info!("downloading {path}");
        let mut curl = Command::new("curl");
        curl.arg("-fsSL").arg("--create-dirs").arg2("-o", &dest).arg(url);
        run(curl, "curl").await?;
    }

    let python = recipe.python_bin(toolkit);
    if !tokio::fs::try_exists(&python).await? {
        info!("creating {} venv", recipe.name);
        let mut venv = Command::new(recipe.python);
        venv.arg2("-m", "venv").arg(dir.join("venv"));
        run(venv, recipe.python).await?;
    }

    for req in recipe.requirements {
        let mut pip = Command::new(&python);
        pip.arg2("-m", "pip").arg("install").arg2("-r", dir.join(req));
        run(pip, "pip").await?;
    }
    if !recipe.packages.is_empty() {
        let mut pip = Command::new(&python);
        pip.arg2("-m", "pip").arg("install").args(recipe.packages);
        run(pip, "pip").await?;
    }
    for sub in recipe.editable {
        let mut pip = Command::new(&python);
        pip.arg2("-m", "pip").arg("install").arg2("-e", dir.join(sub));
        run(pip, "pip").await?;
    }

    for runner in recipe.runners {
        let path = dir.join(runner.file);
        tokio::fs::write(&path, runner.source)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
    }
    Ok(())
}

/// Ensures modes are provisioned at most once, tracking readiness with
/// `<toolkit>/<mode>/.ready` markers holding the recipe hash.
pub struct Provisioner {
    toolkit: PathBuf,
    offline: bool,
    hook: Box<dyn ProvisionHook>,
    locks: Mutex<HashMap<&'static str, Arc<tokio::sync::Mutex<()>>>>,
}

impl Provisioner {
    pub fn new(toolkit: PathBuf, offline: bool) -> Self {
        Self::with_hook(toolkit, offline, Box::new(External))
    }

    pub fn with_hook(toolkit: PathBuf, offline: bool, hook: Box<dyn ProvisionHook>) -> Self {
        Self {
            toolkit,
            offline,
            hook,
            locks: <_>::default(),
        }
    }

    pub fn toolkit(&self) -> &Path {
        &self.toolkit
    }

    fn marker(&self, mode: &str) -> PathBuf {
        self.toolkit.join(mode).join(READY_MARKER)
    }

    /// Cheap readiness check against the persisted marker.
    pub async fn is_ready(&self, mode: &str, provision: &Provision) -> bool {
        if matches!(provision, Provision::None) {
            return true;
        }
        match tokio::fs::read_to_string(self.marker(mode)).await {
            Ok(marker) => marker.trim() == recipe_hash(provision).to_hex().as_str(),
            Err(_) => false,
        }
    }

    /// Lock shared by all modes provisioning the same target.
    fn lock(&self, provision: &Provision, mode: &'static str) -> Arc<tokio::sync::Mutex<()>> {
        let key = match provision {
            Provision::Model(recipe) => recipe.name,
            _ => mode,
        };
        let mut locks = match self.locks.lock() {
            Ok(locks) => locks,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks.entry(key).or_default().clone()
    }

    /// Provision `mode` if not already ready. Concurrent callers for the same
    /// target wait on a single provisioning run.
    pub async fn ensure_ready(
        &self,
        mode: &'static str,
        provision: &Provision,
    ) -> Result<(), ScoreError> {
        if self.is_ready(mode, provision).await {
            return Ok(());
        }

        let lock = self.lock(provision, mode);
        let _guard = lock.lock().await;
        if self.is_ready(mode, provision).await {
            return Ok(());
        }

        let fail = |source: anyhow::Error| ScoreError::Provisioning {
            mode: mode.into(),
            source,
        };
        if self.offline {
            return Err(fail(anyhow::anyhow!(
                "not provisioned and running offline"
            )));
        }

        info!("provisioning {mode} ({})", provision.label());
        self.hook
            .provision(provision, &self.toolkit)
            .await
            .map_err(fail)?;

        if let Provision::Model(recipe) = provision {
            let missing = recipe.missing_files(&self.toolkit).await;
            if let Some(first) = missing.first() {
                return Err(fail(anyhow::anyhow!(
                    "{} missing after provisioning ({} files missing)",
                    first.display(),
                    missing.len()
                )));
            }
        }

        let marker = self.marker(mode);
        write_marker(&marker, provision)
            .await
            .with_context(|| format!("writing {}", marker.display()))
            .map_err(fail)?;
        Ok(())
    }
}

async fn write_marker(marker: &Path, provision: &Provision) -> anyhow::Result<()> {
    if let Some(dir) = marker.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    tokio::fs::write(marker, recipe_hash(provision).to_hex().as_str()).await?;
    Ok(())
}

fn recipe_hash(provision: &Provision) -> blake3::Hash {
    let mut hasher = blake3::Hasher::new();
    provision.hash(&mut BlakeStdHasher(&mut hasher));
    hasher.finalize()
}

struct BlakeStdHasher<'a>(&'a mut blake3::Hasher);
impl std::hash::Hasher for BlakeStdHasher<'_> {
    fn finish(&self) -> u64 {
        unimplemented!()
    }

    #[inline]
    fn write(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }
}

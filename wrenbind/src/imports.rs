use std::{
    collections::{HashMap, HashSet},
    fmt, io,
    path::PathBuf,
    sync::Arc,
};

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::RwLock;

use crate::LoadError;

/// Fetches module source by name. The engine never calls this directly;
/// sources reach it only through [`ImportResolver`]'s cache.
#[async_trait]
pub trait ResourceLoader: Send + Sync {
    async fn load(&self, name: &str) -> Result<String, LoadError>;
}

/// Reads `<root>/<name>.<extension>`.
#[derive(Debug, Clone)]
pub struct FsLoader {
    pub root: PathBuf,
    pub extension: String,
}

impl FsLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            extension: "wren".to_owned(),
        }
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.{}", self.extension))
    }
}

impl Default for FsLoader {
    fn default() -> Self {
        Self::new(".")
    }
}

#[async_trait]
impl ResourceLoader for FsLoader {
    async fn load(&self, name: &str) -> Result<String, LoadError> {
        let path = self.path_for(name);
        log::trace!("loading module `{name}` from {}", path.display());
        match tokio::fs::read_to_string(&path).await {
            Ok(source) => Ok(source),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(LoadError::NotFound(name.to_owned())),
            Err(source) => Err(LoadError::Io {
                name: name.to_owned(),
                source,
            }),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryLoader {
    modules: HashMap<String, String>,
}

impl MemoryLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, source: &str) -> Self {
        self.insert(name, source);
        self
    }

    pub fn insert(&mut self, name: &str, source: &str) {
        self.modules.insert(name.to_owned(), source.to_owned());
    }
}

#[async_trait]
impl ResourceLoader for MemoryLoader {
    async fn load(&self, name: &str) -> Result<String, LoadError> {
        self.modules
            .get(name)
            .cloned()
            .ok_or_else(|| LoadError::NotFound(name.to_owned()))
    }
}

/// Restricts an inner loader to a declared set of module names.
#[derive(Debug, Clone)]
pub struct AllowList<L> {
    inner: L,
    allowed: HashSet<String>,
}

impl<L> AllowList<L> {
    pub fn new<I, S>(inner: L, allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            inner,
            allowed: allowed.into_iter().map(Into::into).collect(),
        }
    }

    pub fn allows(&self, name: &str) -> bool {
        self.allowed.contains(name)
    }
}

#[async_trait]
impl<L: ResourceLoader> ResourceLoader for AllowList<L> {
    async fn load(&self, name: &str) -> Result<String, LoadError> {
        if !self.allows(name) {
            log::warn!("refusing to fetch undeclared module `{name}`");
            return Err(LoadError::NotAllowed(name.to_owned()));
        }
        self.inner.load(name).await
    }
}

/// Asynchronous prefetch, synchronous lookup. The engine resolves imports
/// while it is compiling and cannot wait, so anything a script imports
/// must be prefetched first.
pub struct ImportResolver {
    loader: Arc<dyn ResourceLoader>,
    cache: RwLock<HashMap<String, Arc<str>>>,
}

impl fmt::Debug for ImportResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImportResolver")
            .field("cached", &self.cache.read().len())
            .finish_non_exhaustive()
    }
}

impl ImportResolver {
    pub fn new(loader: Arc<dyn ResourceLoader>) -> Self {
        Self {
            loader,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub async fn prefetch(&self, name: &str) -> Result<(), LoadError> {
        let source = self.loader.load(name).await?;
        log::trace!("cached module `{name}` ({} bytes)", source.len());
        self.cache.write().insert(name.to_owned(), source.into());
        Ok(())
    }

    /// Every fetch runs to completion. The first failure in input order is
    /// returned; modules that did load stay cached either way.
    pub async fn prefetch_all<S: AsRef<str>>(&self, names: &[S]) -> Result<(), LoadError> {
        let outcomes = join_all(names.iter().map(|name| self.prefetch(name.as_ref()))).await;
        outcomes.into_iter().collect()
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<str>> {
        let source = self.cache.read().get(name).cloned();
        if source.is_none() {
            log::trace!("module `{name}` is not cached");
        }
        source
    }

    pub fn is_cached(&self, name: &str) -> bool {
        self.cache.read().contains_key(name)
    }

    pub fn cached_modules(&self) -> Vec<String> {
        let mut names: Vec<_> = self.cache.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn evict(&self, name: &str) -> bool {
        self.cache.write().remove(name).is_some()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct Counting {
        inner: MemoryLoader,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ResourceLoader for Counting {
        async fn load(&self, name: &str) -> Result<String, LoadError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.load(name).await
        }
    }

    #[tokio::test]
    async fn failed_batch_keeps_successful_entries() {
        let loader = MemoryLoader::new()
            .with("a", "var A = 1")
            .with("c", "var C = 3");
        let resolver = ImportResolver::new(Arc::new(loader));

        let err = resolver.prefetch_all(&["a", "b", "c"]).await.unwrap_err();
        assert!(matches!(err, LoadError::NotFound(ref name) if name == "b"));
        assert!(resolver.is_cached("a"));
        assert!(!resolver.is_cached("b"));
        assert!(resolver.is_cached("c"));
        assert_eq!(resolver.cached_modules(), vec!["a", "c"]);
    }

    #[tokio::test]
    async fn first_failure_in_input_order_is_reported() {
        let resolver = ImportResolver::new(Arc::new(MemoryLoader::new()));
        let err = resolver.prefetch_all(&["x", "y"]).await.unwrap_err();
        assert!(matches!(err, LoadError::NotFound(ref name) if name == "x"));
    }

    #[tokio::test]
    async fn lookup_never_fetches() {
        let loader = Arc::new(Counting {
            inner: MemoryLoader::new().with("util", "var U = 0"),
            calls: AtomicUsize::new(0),
        });
        let resolver = ImportResolver::new(loader.clone());

        assert!(resolver.lookup("util").is_none());
        assert_eq!(loader.calls.load(Ordering::SeqCst), 0);

        resolver.prefetch("util").await.unwrap();
        assert_eq!(resolver.lookup("util").as_deref(), Some("var U = 0"));
        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);

        assert!(resolver.evict("util"));
        assert!(resolver.lookup("util").is_none());
    }

    #[tokio::test]
    async fn allow_list_rejects_undeclared_modules() {
        let inner = MemoryLoader::new().with("ok", "").with("secret", "");
        let loader = AllowList::new(inner, ["ok"]);
        assert!(loader.load("ok").await.is_ok());
        assert!(matches!(
            loader.load("secret").await,
            Err(LoadError::NotAllowed(name)) if name == "secret"
        ));
    }

    #[tokio::test]
    async fn fs_loader_appends_the_extension() {
        let root = std::env::temp_dir().join(format!("wrenbind-fs-{}", std::process::id()));
        tokio::fs::create_dir_all(&root).await.unwrap();
        tokio::fs::write(root.join("greet.wren"), "var Greeting = \"hi\"")
            .await
            .unwrap();

        let loader = FsLoader::new(&root);
        assert_eq!(loader.load("greet").await.unwrap(), "var Greeting = \"hi\"");
        assert!(matches!(
            loader.load("missing").await,
            Err(LoadError::NotFound(name)) if name == "missing"
        ));

        tokio::fs::remove_dir_all(&root).await.unwrap();
    }
}

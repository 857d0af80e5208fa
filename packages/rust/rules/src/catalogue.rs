//! Persisted rule catalogue and noise cache documents.
//!
//! Both documents live as versioned JSON files in the data directory and are
//! replaced via write-temp-then-rename, so a concurrent snapshot reload sees
//! either the old or the new document, never a torn one. Merging is per
//! source: sources absent from a discovery run are left untouched.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, info};

use curator_shared::{
    CURRENT_SCHEMA_VERSION, ClassificationRule, CuratorError, NoiseCache, Result, RuleCatalogue,
};

use crate::snapshot::RuleSnapshot;

/// File name of the rule catalogue document.
pub const RULES_FILE: &str = "rules.json";

/// File name of the noise cache document.
pub const NOISE_CACHE_FILE: &str = "noise_cache.json";

/// Output of one discovery run, grouped by source, ready to merge.
#[derive(Debug, Default)]
pub struct DiscoveryOutput {
    /// Replacement rule lists per source key.
    pub rules_by_source: BTreeMap<String, Vec<ClassificationRule>>,
    /// Replacement noise URL lists per source key.
    pub noise_by_source: BTreeMap<String, Vec<String>>,
    /// Global rules replace the existing list only when explicitly provided.
    pub global_rules: Option<Vec<ClassificationRule>>,
}

impl DiscoveryOutput {
    pub fn is_empty(&self) -> bool {
        self.rules_by_source.is_empty()
            && self.noise_by_source.is_empty()
            && self.global_rules.is_none()
    }
}

/// Handle on the catalogue documents in a data directory.
pub struct CatalogueStore {
    dir: PathBuf,
}

impl CatalogueStore {
    /// Open a store rooted at `dir`, creating the directory if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| CuratorError::io(&dir, e))?;
        Ok(Self { dir })
    }

    /// Load the rule catalogue, or an empty default if the file is absent.
    pub fn load_catalogue(&self) -> Result<RuleCatalogue> {
        let path = self.dir.join(RULES_FILE);
        if !path.exists() {
            debug!(?path, "catalogue file not found, starting empty");
            return Ok(RuleCatalogue::default());
        }
        let content = std::fs::read_to_string(&path).map_err(|e| CuratorError::io(&path, e))?;
        let catalogue: RuleCatalogue = serde_json::from_str(&content)
            .map_err(|e| CuratorError::Catalogue(format!("{}: {e}", path.display())))?;
        if catalogue.schema_version > CURRENT_SCHEMA_VERSION {
            return Err(CuratorError::Catalogue(format!(
                "catalogue schema v{} is newer than supported v{CURRENT_SCHEMA_VERSION}",
                catalogue.schema_version
            )));
        }
        Ok(catalogue)
    }

    /// Load the noise cache, or an empty default if the file is absent.
    pub fn load_noise_cache(&self) -> Result<NoiseCache> {
        let path = self.dir.join(NOISE_CACHE_FILE);
        if !path.exists() {
            debug!(?path, "noise cache file not found, starting empty");
            return Ok(NoiseCache::default());
        }
        let content = std::fs::read_to_string(&path).map_err(|e| CuratorError::io(&path, e))?;
        serde_json::from_str(&content)
            .map_err(|e| CuratorError::Catalogue(format!("{}: {e}", path.display())))
    }

    /// Compile the current documents into a fresh snapshot.
    pub fn load_snapshot(&self) -> Result<RuleSnapshot> {
        let catalogue = self.load_catalogue()?;
        let noise = self.load_noise_cache()?;
        Ok(RuleSnapshot::build(&catalogue, &noise))
    }

    /// Merge a discovery run into the persisted documents.
    ///
    /// Each source present in the output has its rule/noise list replaced
    /// wholesale; everything else is carried over unchanged. Returns the
    /// merged catalogue.
    pub fn merge(&self, output: DiscoveryOutput) -> Result<RuleCatalogue> {
        let mut catalogue = self.load_catalogue()?;
        let mut noise = self.load_noise_cache()?;
        let now = Utc::now();

        if let Some(global_rules) = output.global_rules {
            catalogue.global_rules = global_rules;
        }
        for (source, rules) in output.rules_by_source {
            info!(source = %source, rules = rules.len(), "replacing source rules");
            catalogue.sources.insert(source, rules);
        }
        for (source, urls) in output.noise_by_source {
            let mut urls = urls;
            urls.sort();
            urls.dedup();
            noise.sources.insert(source, urls);
        }

        catalogue.updated_at = now;
        noise.updated_at = now;

        self.write_atomic(RULES_FILE, &catalogue)?;
        self.write_atomic(NOISE_CACHE_FILE, &noise)?;

        Ok(catalogue)
    }

    /// Serialize to a temp file next to the target, then rename over it.
    fn write_atomic<T: serde::Serialize>(&self, file_name: &str, value: &T) -> Result<()> {
        let path = self.dir.join(file_name);
        let tmp = self.dir.join(format!("{file_name}.tmp"));

        let json = serde_json::to_string_pretty(value)
            .map_err(|e| CuratorError::Catalogue(e.to_string()))?;
        std::fs::write(&tmp, json).map_err(|e| CuratorError::io(&tmp, e))?;
        std::fs::rename(&tmp, &path).map_err(|e| CuratorError::io(&path, e))?;

        debug!(?path, "catalogue document written");
        Ok(())
    }

    /// The directory this store reads from and writes to.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use curator_shared::{ContentType, RuleScope};

    /// Fresh directory per test.
    fn temp_dir(label: &str) -> PathBuf {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let n = COUNTER.fetch_add(1, Ordering::SeqCst);
        std::env::temp_dir().join(format!(
            "curator-catalogue-{label}-{}-{n}",
            std::process::id()
        ))
    }

    fn source_rule(key: &str, pattern: &str, name: &str) -> ClassificationRule {
        ClassificationRule {
            pattern: pattern.into(),
            content_type: ContentType::Content,
            name: name.into(),
            scope: RuleScope::Source,
            source_key: Some(key.into()),
            metadata: None,
        }
    }

    #[test]
    fn missing_files_load_as_empty_defaults() {
        let store = CatalogueStore::open(temp_dir("empty")).unwrap();
        let catalogue = store.load_catalogue().unwrap();
        assert!(catalogue.global_rules.is_empty());
        assert!(store.load_noise_cache().unwrap().sources.is_empty());
        assert!(store.load_snapshot().unwrap().is_empty());
    }

    #[test]
    fn merge_replaces_only_named_sources() {
        let store = CatalogueStore::open(temp_dir("merge")).unwrap();

        let mut first = DiscoveryOutput::default();
        first.rules_by_source.insert(
            "a.com".into(),
            vec![source_rule("a.com", "/old/", "old_rule")],
        );
        first
            .rules_by_source
            .insert("b.com".into(), vec![source_rule("b.com", "/b/", "b_rule")]);
        store.merge(first).unwrap();

        let mut second = DiscoveryOutput::default();
        second.rules_by_source.insert(
            "a.com".into(),
            vec![source_rule("a.com", "/new/", "new_rule")],
        );
        let merged = store.merge(second).unwrap();

        assert_eq!(merged.sources["a.com"][0].name, "new_rule");
        // b.com was not in the second run and must be untouched.
        assert_eq!(merged.sources["b.com"][0].name, "b_rule");
    }

    #[test]
    fn merge_leaves_global_rules_unless_provided() {
        let store = CatalogueStore::open(temp_dir("globals")).unwrap();

        let mut with_globals = DiscoveryOutput::default();
        with_globals.global_rules = Some(vec![ClassificationRule {
            pattern: "/live/".into(),
            content_type: ContentType::Noise,
            name: "live_blog".into(),
            scope: RuleScope::Global,
            source_key: None,
            metadata: None,
        }]);
        store.merge(with_globals).unwrap();

        let mut source_only = DiscoveryOutput::default();
        source_only
            .rules_by_source
            .insert("a.com".into(), vec![source_rule("a.com", "/a/", "a_rule")]);
        let merged = store.merge(source_only).unwrap();

        assert_eq!(merged.global_rules.len(), 1);
        assert_eq!(merged.global_rules[0].name, "live_blog");
    }

    #[test]
    fn noise_urls_are_deduplicated_and_sorted() {
        let store = CatalogueStore::open(temp_dir("noise")).unwrap();

        let mut output = DiscoveryOutput::default();
        output.noise_by_source.insert(
            "a.com".into(),
            vec![
                "https://a.com/privacy".into(),
                "https://a.com/about".into(),
                "https://a.com/privacy".into(),
            ],
        );
        store.merge(output).unwrap();

        let noise = store.load_noise_cache().unwrap();
        assert_eq!(
            noise.sources["a.com"],
            vec![
                "https://a.com/about".to_string(),
                "https://a.com/privacy".to_string()
            ]
        );
    }

    #[test]
    fn merged_documents_survive_reload() {
        let dir = temp_dir("reload");
        {
            let store = CatalogueStore::open(&dir).unwrap();
            let mut output = DiscoveryOutput::default();
            output
                .rules_by_source
                .insert("a.com".into(), vec![source_rule("a.com", "/a/", "a_rule")]);
            store.merge(output).unwrap();
        }
        let store = CatalogueStore::open(&dir).unwrap();
        let snapshot = store.load_snapshot().unwrap();
        assert_eq!(snapshot.rule_count(), 1);
    }
}

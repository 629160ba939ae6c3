// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! kiwi-store
#![deny(unsafe_code)]

pub mod bundled;
pub mod parse;

pub use bundled::{BUNDLED, BundledFile, PRELOAD_RUNTIMES};
pub use kiwi_signature::VerifyMode;

use kiwi_core::{Item, ItemType, Manifest, Origin};
use kiwi_error::{KernelError, KernelResult};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Name of the manifest file inside a multi-file tool directory.
const TOOL_MANIFEST_FILE: &str = "tool.yaml";

/// Content-root directory name inside a project.
pub const AI_DIR: &str = ".ai";

// ---------------------------------------------------------------------------
// Protected prefixes
// ---------------------------------------------------------------------------

/// Category prefixes that always resolve from the bundled layer.
///
/// Only tools and knowledge can be protected; directives are shadowable.
/// When several prefixes match, the longest one wins.
#[derive(Debug, Clone)]
pub struct ProtectedPrefixes {
    /// Protected tool category prefixes.
    pub tools: Vec<String>,
    /// Protected knowledge category prefixes.
    pub knowledge: Vec<String>,
}

impl Default for ProtectedPrefixes {
    fn default() -> Self {
        Self {
            tools: ["core/", "primitives/", "runtimes/", "capabilities/"]
                .map(String::from)
                .to_vec(),
            knowledge: ["kernel/", "rye/"].map(String::from).to_vec(),
        }
    }
}

impl ProtectedPrefixes {
    /// The longest prefix protecting `rel` (a `category/id` path), if any.
    pub fn matching_prefix(&self, item_type: ItemType, rel: &str) -> Option<&str> {
        let prefixes = match item_type {
            ItemType::Tool => &self.tools,
            ItemType::Knowledge => &self.knowledge,
            // Directives follow plain precedence; System is virtual.
            ItemType::Directive | ItemType::System => return None,
        };
        prefixes
            .iter()
            .filter(|p| rel.starts_with(p.as_str()))
            .max_by_key(|p| p.len())
            .map(String::as_str)
    }

    /// Whether `rel` sits under a protected prefix.
    pub fn is_protected(&self, item_type: ItemType, rel: &str) -> bool {
        self.matching_prefix(item_type, rel).is_some()
    }
}

// ---------------------------------------------------------------------------
// Candidates
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Source {
    Fs(PathBuf),
    Static(&'static str),
}

#[derive(Debug, Clone)]
struct Candidate {
    origin: Origin,
    id: String,
    category: String,
    source: Source,
    /// Directory holding extra files for multi-file tools.
    file_dir: Option<PathBuf>,
}

impl Candidate {
    fn rel(&self) -> String {
        if self.category.is_empty() {
            self.id.clone()
        } else {
            format!("{}/{}", self.category, self.id)
        }
    }
}

// ---------------------------------------------------------------------------
// ContentStore
// ---------------------------------------------------------------------------

/// Three-layer item resolver.
///
/// Holds the user root and policy knobs; the project root travels with each
/// call because every meta-operation carries its own `project_path`.
#[derive(Debug, Clone)]
pub struct ContentStore {
    user_root: PathBuf,
    protected: ProtectedPrefixes,
    verify_mode: VerifyMode,
}

impl ContentStore {
    /// Create a store over an explicit user root.
    pub fn new(user_root: impl Into<PathBuf>) -> Self {
        Self {
            user_root: user_root.into(),
            protected: ProtectedPrefixes::default(),
            verify_mode: VerifyMode::default(),
        }
    }

    /// Create a store from `USER_PATH` (falling back to `~/.ai`).
    pub fn from_env() -> Self {
        let root = std::env::var("USER_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
                Path::new(&home).join(AI_DIR)
            });
        Self::new(root)
    }

    /// Override the verification mode for local layers.
    #[must_use]
    pub fn with_verify_mode(mut self, mode: VerifyMode) -> Self {
        self.verify_mode = mode;
        self
    }

    /// Override the protected-prefix set.
    #[must_use]
    pub fn with_protected(mut self, protected: ProtectedPrefixes) -> Self {
        self.protected = protected;
        self
    }

    /// The user content root.
    pub fn user_root(&self) -> &Path {
        &self.user_root
    }

    /// The protected-prefix configuration.
    pub fn protected(&self) -> &ProtectedPrefixes {
        &self.protected
    }

    /// The project content root for a given project path.
    pub fn project_root(project: &Path) -> PathBuf {
        project.join(AI_DIR)
    }

    // -- lookup -------------------------------------------------------------

    /// Resolve `(type, id)` through the three layers.
    pub fn get(
        &self,
        project: &Path,
        item_type: ItemType,
        id: &str,
        version: Option<&str>,
    ) -> KernelResult<Item> {
        self.resolve(project, item_type, id, version, None, true)
    }

    /// Resolve from one specific layer.
    pub fn get_from(
        &self,
        origin: Origin,
        project: &Path,
        item_type: ItemType,
        id: &str,
        version: Option<&str>,
    ) -> KernelResult<Item> {
        self.resolve(project, item_type, id, version, Some(origin), true)
    }

    /// Resolve the manifest only (extra files are not read).
    pub fn get_manifest(
        &self,
        project: &Path,
        item_type: ItemType,
        id: &str,
    ) -> KernelResult<Item> {
        self.resolve(project, item_type, id, None, None, false)
    }

    /// Batch lookup: one scan per layer regardless of how many ids are asked.
    pub fn get_many(
        &self,
        project: &Path,
        item_type: ItemType,
        ids: &[String],
    ) -> BTreeMap<String, KernelResult<Item>> {
        let mut by_id: BTreeMap<String, Vec<Candidate>> = BTreeMap::new();
        for candidate in self.all_candidates(project, item_type) {
            if ids.contains(&candidate.id) {
                by_id.entry(candidate.id.clone()).or_default().push(candidate);
            }
        }

        let mut out = BTreeMap::new();
        for id in ids {
            let candidates = by_id.remove(id).unwrap_or_default();
            out.insert(
                id.clone(),
                self.pick_and_load(item_type, id, None, candidates, true),
            );
        }
        out
    }

    /// List items of a type (manifests only), honoring shadowing and
    /// protection. `category` filters on the category prefix.
    pub fn list(
        &self,
        project: &Path,
        item_type: ItemType,
        category: Option<&str>,
    ) -> Vec<Item> {
        let mut seen: BTreeMap<String, Candidate> = BTreeMap::new();
        for candidate in self.all_candidates(project, item_type) {
            if let Some(cat) = category {
                if !candidate.category.starts_with(cat) {
                    continue;
                }
            }
            let protected = self.protected.is_protected(item_type, &candidate.rel());
            match seen.get(&candidate.id).map(|c| c.origin) {
                // Bundled copies of protected items displace any shadow.
                Some(existing_origin)
                    if protected
                        && candidate.origin == Origin::Bundled
                        && existing_origin != Origin::Bundled =>
                {
                    seen.insert(candidate.id.clone(), candidate);
                }
                Some(_) => {}
                None => {
                    if protected && candidate.origin != Origin::Bundled {
                        // Masquerading under a protected prefix; the bundled
                        // copy (if any) will take the slot.
                        continue;
                    }
                    seen.insert(candidate.id.clone(), candidate);
                }
            }
        }

        seen.into_values()
            .filter_map(|c| {
                let id = c.id.clone();
                match self.load_candidate(item_type, &id, c, false) {
                    Ok(item) => Some(item),
                    Err(e) => {
                        warn!(target: "kiwi.store", %id, error = %e, "skipping unloadable item");
                        None
                    }
                }
            })
            .collect()
    }

    // -- writes -------------------------------------------------------------

    /// Write an item's source (and extra files) into the project or user
    /// layer. Protected prefixes refuse the write.
    pub fn write_item(
        &self,
        layer: Origin,
        project: &Path,
        item_type: ItemType,
        category: &str,
        id: &str,
        source: &str,
        files: &BTreeMap<String, String>,
    ) -> KernelResult<PathBuf> {
        let root = self.writable_root(layer, project)?;
        let rel = if category.is_empty() {
            id.to_string()
        } else {
            format!("{category}/{id}")
        };
        if self.protected.is_protected(item_type, &rel) {
            return Err(KernelError::permission_denied(format!(
                "'{rel}' sits under a protected prefix; bundled content cannot be shadowed"
            ))
            .with_suggestion("choose a category outside the protected set"));
        }

        let type_dir = item_type
            .dir_name()
            .ok_or_else(|| KernelError::invalid_item("system items are virtual"))?;
        let base = root.join(type_dir).join(category);

        let primary = match item_type {
            ItemType::Tool if !files.is_empty() => base.join(id).join(TOOL_MANIFEST_FILE),
            ItemType::Tool => base.join(format!("{id}.yaml")),
            _ => base.join(format!("{id}.md")),
        };

        let parent = primary
            .parent()
            .ok_or_else(|| KernelError::invalid_item("item path has no parent"))?;
        std::fs::create_dir_all(parent).map_err(write_err)?;
        std::fs::write(&primary, source).map_err(write_err)?;
        for (name, content) in files {
            let path = parent.join(name);
            if let Some(p) = path.parent() {
                std::fs::create_dir_all(p).map_err(write_err)?;
            }
            std::fs::write(&path, content).map_err(write_err)?;
        }

        debug!(target: "kiwi.store", id, path = %primary.display(), "item written");
        Ok(primary)
    }

    /// Delete an item from the project or user layer.
    pub fn delete_item(
        &self,
        layer: Origin,
        project: &Path,
        item_type: ItemType,
        id: &str,
    ) -> KernelResult<()> {
        let root = self.writable_root(layer, project)?;
        let candidate = scan_fs_layer(&root, layer, item_type)
            .into_iter()
            .find(|c| c.id == id)
            .ok_or_else(|| {
                KernelError::not_found(format!("{item_type} '{id}' not found in {layer} layer"))
            })?;
        if self.protected.is_protected(item_type, &candidate.rel()) {
            return Err(KernelError::permission_denied(format!(
                "'{}' is protected and cannot be deleted",
                candidate.rel()
            )));
        }

        match (&candidate.source, &candidate.file_dir) {
            (_, Some(dir)) => std::fs::remove_dir_all(dir).map_err(write_err)?,
            (Source::Fs(path), None) => std::fs::remove_file(path).map_err(write_err)?,
            (Source::Static(_), _) => {
                return Err(KernelError::permission_denied(
                    "bundled items cannot be deleted",
                ));
            }
        }
        Ok(())
    }

    /// The on-disk path of an item's primary file in a given layer.
    pub fn source_path(
        &self,
        layer: Origin,
        project: &Path,
        item_type: ItemType,
        id: &str,
    ) -> KernelResult<PathBuf> {
        let root = self.writable_root(layer, project)?;
        scan_fs_layer(&root, layer, item_type)
            .into_iter()
            .find(|c| c.id == id)
            .and_then(|c| match c.source {
                Source::Fs(p) => Some(p),
                Source::Static(_) => None,
            })
            .ok_or_else(|| {
                KernelError::not_found(format!("{item_type} '{id}' not found in {layer} layer"))
            })
    }

    // -- internals ----------------------------------------------------------

    fn writable_root(&self, layer: Origin, project: &Path) -> KernelResult<PathBuf> {
        match layer {
            Origin::Project => Ok(Self::project_root(project)),
            Origin::User => Ok(self.user_root.clone()),
            other => Err(KernelError::invalid_item(format!(
                "layer '{other}' is not writable"
            ))),
        }
    }

    fn resolve(
        &self,
        project: &Path,
        item_type: ItemType,
        id: &str,
        version: Option<&str>,
        only: Option<Origin>,
        with_files: bool,
    ) -> KernelResult<Item> {
        let mut candidates: Vec<Candidate> = self
            .all_candidates(project, item_type)
            .into_iter()
            .filter(|c| c.id == id)
            .collect();
        if let Some(origin) = only {
            candidates.retain(|c| c.origin == origin);
        }
        self.pick_and_load(item_type, id, version, candidates, with_files)
    }

    fn pick_and_load(
        &self,
        item_type: ItemType,
        id: &str,
        version: Option<&str>,
        candidates: Vec<Candidate>,
        with_files: bool,
    ) -> KernelResult<Item> {
        if candidates.is_empty() {
            return Err(KernelError::not_found(format!(
                "{item_type} '{id}' not found in any layer"
            ))
            .with_suggestion("run `search` to list available items"));
        }

        // Protected ids resolve from the bundled layer no matter what sits
        // at higher-priority roots.
        let bundled_protected = candidates.iter().position(|c| {
            c.origin == Origin::Bundled && self.protected.is_protected(item_type, &c.rel())
        });
        let ordered: Vec<&Candidate> = match bundled_protected {
            Some(idx) => vec![&candidates[idx]],
            None => candidates
                .iter()
                .filter(|c| !self.protected.is_protected(item_type, &c.rel()))
                .collect(),
        };

        if ordered.is_empty() {
            return Err(KernelError::not_found(format!(
                "{item_type} '{id}' exists only as an invalid shadow of protected content"
            )));
        }

        let mut last_err = None;
        for candidate in ordered {
            match self.load_candidate(item_type, id, (*candidate).clone(), with_files) {
                Ok(item) => {
                    if let Some(want) = version {
                        if item.version != want {
                            last_err = Some(
                                KernelError::not_found(format!(
                                    "{item_type} '{id}' version '{want}' not found"
                                ))
                                .with_context("available_version", item.version.clone()),
                            );
                            continue;
                        }
                    }
                    return Ok(item);
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            KernelError::not_found(format!("{item_type} '{id}' not found"))
        }))
    }

    fn load_candidate(
        &self,
        item_type: ItemType,
        id: &str,
        candidate: Candidate,
        with_files: bool,
    ) -> KernelResult<Item> {
        let source = match &candidate.source {
            Source::Fs(path) => std::fs::read_to_string(path).map_err(io_err)?,
            Source::Static(content) => (*content).to_string(),
        };

        let signature = kiwi_signature::verify_required(&source, id, self.verify_mode)?;

        let manifest = match item_type {
            ItemType::Tool => Manifest::Tool(parse::parse_tool(id, &source)?),
            ItemType::Directive => Manifest::Directive(parse::parse_directive(id, &source)?),
            ItemType::Knowledge => {
                let (m, _body) = parse::parse_knowledge(id, &source)?;
                Manifest::Knowledge(m)
            }
            ItemType::System => {
                return Err(KernelError::invalid_item("system items are virtual"));
            }
        };

        let mut files = BTreeMap::new();
        if with_files {
            if let Some(dir) = &candidate.file_dir {
                files = read_extra_files(dir);
            }
        }

        Ok(Item {
            id: id.to_string(),
            version: manifest.common().version.clone(),
            item_type,
            category: candidate.category.clone(),
            origin: candidate.origin,
            manifest,
            source,
            files,
            signature,
            path: match &candidate.source {
                Source::Fs(p) => Some(p.clone()),
                Source::Static(_) => None,
            },
        })
    }

    /// All candidates for a type across the three layers, priority order.
    fn all_candidates(&self, project: &Path, item_type: ItemType) -> Vec<Candidate> {
        let mut out = Vec::new();
        out.extend(scan_fs_layer(
            &Self::project_root(project),
            Origin::Project,
            item_type,
        ));
        out.extend(scan_fs_layer(&self.user_root, Origin::User, item_type));
        out.extend(scan_bundled(item_type));
        out
    }
}

fn io_err(e: std::io::Error) -> KernelError {
    KernelError::not_found(format!("content store I/O failure: {e}"))
}

fn write_err(e: std::io::Error) -> KernelError {
    KernelError::execution_failed(format!("content store write failure: {e}"))
}

fn read_extra_files(dir: &Path) -> BTreeMap<String, String> {
    let mut files = BTreeMap::new();
    for entry in WalkDir::new(dir).min_depth(1).into_iter().flatten() {
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(dir) else {
            continue;
        };
        let rel = rel.to_string_lossy().to_string();
        if rel == TOOL_MANIFEST_FILE {
            continue;
        }
        match std::fs::read_to_string(entry.path()) {
            Ok(content) => {
                files.insert(rel, content);
            }
            Err(e) => {
                warn!(target: "kiwi.store", file = %rel, error = %e, "skipping unreadable tool file");
            }
        }
    }
    files
}

fn scan_fs_layer(root: &Path, origin: Origin, item_type: ItemType) -> Vec<Candidate> {
    let Some(type_dir) = item_type.dir_name() else {
        return Vec::new();
    };
    let base = root.join(type_dir);
    if !base.is_dir() {
        return Vec::new();
    }

    let mut out = Vec::new();
    for entry in WalkDir::new(&base).min_depth(1).into_iter().flatten() {
        let path = entry.path();
        let Ok(rel) = path.strip_prefix(&base) else {
            continue;
        };

        if entry.file_type().is_file() {
            let name = entry.file_name().to_string_lossy();
            // `tool.yaml` inside an item directory is handled via the dir.
            if name == TOOL_MANIFEST_FILE {
                continue;
            }
            let wanted_ext = match item_type {
                ItemType::Tool => "yaml",
                _ => "md",
            };
            let Some(stem) = path.file_stem().map(|s| s.to_string_lossy().to_string()) else {
                continue;
            };
            if path.extension().and_then(|e| e.to_str()) != Some(wanted_ext) {
                continue;
            }
            // Files nested anywhere inside a multi-file tool dir are not
            // items of their own.
            if item_type == ItemType::Tool
                && rel.ancestors().skip(1).any(|p| {
                    !p.as_os_str().is_empty()
                        && base.join(p).join(TOOL_MANIFEST_FILE).is_file()
                })
            {
                continue;
            }
            let category = rel
                .parent()
                .map(|p| p.to_string_lossy().replace('\\', "/"))
                .unwrap_or_default();
            out.push(Candidate {
                origin,
                id: stem,
                category,
                source: Source::Fs(path.to_path_buf()),
                file_dir: None,
            });
        } else if entry.file_type().is_dir() && item_type == ItemType::Tool {
            let manifest = path.join(TOOL_MANIFEST_FILE);
            if manifest.is_file() {
                let category = rel
                    .parent()
                    .map(|p| p.to_string_lossy().replace('\\', "/"))
                    .unwrap_or_default();
                out.push(Candidate {
                    origin,
                    id: entry.file_name().to_string_lossy().to_string(),
                    category,
                    source: Source::Fs(manifest),
                    file_dir: Some(path.to_path_buf()),
                });
            }
        }
    }
    out
}

fn scan_bundled(item_type: ItemType) -> Vec<Candidate> {
    let Some(type_dir) = item_type.dir_name() else {
        return Vec::new();
    };
    let prefix = format!("{type_dir}/");
    BUNDLED
        .iter()
        .filter_map(|f| {
            let rel = f.path.strip_prefix(&prefix)?;
            let (category, file) = match rel.rsplit_once('/') {
                Some((c, f)) => (c.to_string(), f),
                None => (String::new(), rel),
            };
            let id = file.rsplit_once('.')?.0.to_string();
            Some(Candidate {
                origin: Origin::Bundled,
                id,
                category,
                source: Source::Static(f.content),
                file_dir: None,
            })
        })
        .collect()
}

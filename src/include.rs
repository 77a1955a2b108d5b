//! Include graph of templates.
//!
//! The dev server needs to know which templates a page pulls in through
//! `extends`, `include`, `import` and `from`, so that an edit to a layout or a
//! partial invalidates every page built on top of it. The graph is queried
//! per directory and returns loosely shaped data; [`flatten`] reduces any
//! entry to the set of paths it mentions.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::io;
use std::sync::LazyLock;

use camino::{Utf8Path, Utf8PathBuf};
use rayon::iter::{IntoParallelIterator, IntoParallelRefIterator, ParallelIterator};
use regex::Regex;
use serde_json::{Value, json};

use crate::TEMPLATE_EXT;
use crate::error::IncludeError;
use crate::utils::normalize_path;

/// Absolute template path mapped to the data describing its relations.
pub type IncludeIndex = HashMap<Utf8PathBuf, Value>;

/// Source of include relations between templates.
pub trait IncludeGraph: Send + Sync {
    /// Indexes every template found under `dir`.
    fn query_directory(&self, dir: &Utf8Path) -> Result<IncludeIndex, IncludeError>;
}

/// Collects every string leaf of `value`, walking through arrays and object
/// values. Object keys are not collected.
pub fn flatten(value: &Value) -> HashSet<String> {
    fn walk(value: &Value, acc: &mut HashSet<String>) {
        match value {
            Value::Array(items) => items.iter().for_each(|item| walk(item, acc)),
            Value::Object(map) => map.values().for_each(|item| walk(item, acc)),
            Value::String(leaf) => {
                acc.insert(leaf.clone());
            }
            _ => {}
        }
    }

    let mut acc = HashSet::new();
    walk(value, &mut acc);
    acc
}

/// Every template `file` is related to according to `graph`, excluding
/// `file` itself.
pub(crate) fn ancestors(
    graph: &dyn IncludeGraph,
    dir: &Utf8Path,
    file: &Utf8Path,
) -> Result<HashSet<Utf8PathBuf>, IncludeError> {
    let index = graph.query_directory(dir)?;

    let Some(entry) = index.get(file) else {
        return Ok(HashSet::new());
    };

    Ok(flatten(entry)
        .into_iter()
        .map(Utf8PathBuf::from)
        .filter(|path| path != file)
        .collect())
}

static REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\{%-?\s*(?:extends|include|import|from)\s+["']([^"']+)["']"#)
        .expect("Error compiling template reference pattern")
});

/// Include graph built by scanning template sources on disk.
///
/// Each entry has the shape
///
/// ```json
/// {
///   "parents": ["/site/base.njk", "/site/partials/nav.njk"],
///   "ancestors": ["/site/base.njk", "/site/head.njk", "/site/partials/nav.njk"],
///   "children": ["/site/blog/post.njk"]
/// }
/// ```
///
/// where `parents` are the templates referenced by the file, `ancestors` is
/// everything reachable through those references, and `children` are the
/// templates referencing it. References are resolved against the referencing
/// file's directory when they start with `./` or `../`, and against the
/// search paths otherwise. Templates outside of the queried directory are
/// followed too.
#[derive(Debug, Clone)]
pub struct ScanIncludeGraph {
    search_paths: Vec<Utf8PathBuf>,
}

impl ScanIncludeGraph {
    pub fn new<P>(search_paths: impl IntoIterator<Item = P>) -> Self
    where
        P: Into<Utf8PathBuf>,
    {
        Self {
            search_paths: search_paths.into_iter().map(Into::into).collect(),
        }
    }

    fn references(&self, file: &Utf8Path) -> Result<Vec<Utf8PathBuf>, IncludeError> {
        let source = match fs::read_to_string(file) {
            Ok(source) => source,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(vec![]),
            Err(err) => return Err(err.into()),
        };

        let mut refs = Vec::new();
        for capture in REFERENCE.captures_iter(&source) {
            if let Some(path) = self.resolve(&capture[1], file)
                && !refs.contains(&path)
            {
                refs.push(path);
            }
        }

        Ok(refs)
    }

    fn resolve(&self, name: &str, from: &Utf8Path) -> Option<Utf8PathBuf> {
        let name = Utf8Path::new(name);

        if name.is_absolute() {
            return Some(normalize_path(name)).filter(|path| path.is_file());
        }

        if name.starts_with(".") || name.starts_with("..") {
            let dir = from.parent()?;
            return Some(normalize_path(&dir.join(name))).filter(|path| path.is_file());
        }

        self.search_paths
            .iter()
            .map(|dir| normalize_path(&dir.join(name)))
            .find(|path| path.is_file())
    }
}

impl IncludeGraph for ScanIncludeGraph {
    fn query_directory(&self, dir: &Utf8Path) -> Result<IncludeIndex, IncludeError> {
        let pattern = format!(
            "{}/**/*.{}",
            glob::Pattern::escape(dir.as_str()),
            TEMPLATE_EXT
        );

        let mut files = Vec::new();
        for path in glob::glob(&pattern)? {
            files.push(normalize_path(&Utf8PathBuf::try_from(path?)?));
        }

        let mut direct: HashMap<Utf8PathBuf, Vec<Utf8PathBuf>> = files
            .into_par_iter()
            .map(|file| {
                let refs = self.references(&file)?;
                Ok((file, refs))
            })
            .collect::<Result<_, IncludeError>>()?;

        let mut queue: VecDeque<Utf8PathBuf> = direct.values().flatten().cloned().collect();
        while let Some(file) = queue.pop_front() {
            if direct.contains_key(&file) {
                continue;
            }
            let refs = self.references(&file)?;
            queue.extend(refs.iter().cloned());
            direct.insert(file, refs);
        }

        let mut children: HashMap<&Utf8Path, Vec<&Utf8Path>> = HashMap::new();
        for (file, refs) in &direct {
            for parent in refs {
                children
                    .entry(parent.as_path())
                    .or_default()
                    .push(file.as_path());
            }
        }

        let index: IncludeIndex = direct
            .par_iter()
            .map(|(file, refs)| {
                let mut referrers: Vec<&str> = children
                    .get(file.as_path())
                    .map(|list| list.iter().map(|path| path.as_str()).collect())
                    .unwrap_or_default();
                referrers.sort_unstable();

                let entry = json!({
                    "parents": refs.iter().map(|path| path.as_str()).collect::<Vec<_>>(),
                    "ancestors": reachable(file, &direct),
                    "children": referrers,
                });
                (file.clone(), entry)
            })
            .collect();

        Ok(index)
    }
}

/// Templates reachable from `file` through references, sorted. Each template
/// is visited once, so shared layouts and include cycles stay linear.
fn reachable<'a>(
    file: &'a Utf8Path,
    direct: &'a HashMap<Utf8PathBuf, Vec<Utf8PathBuf>>,
) -> Vec<&'a str> {
    let mut seen = HashSet::from([file]);
    let mut stack = vec![file];
    let mut found = Vec::new();

    while let Some(next) = stack.pop() {
        for parent in direct.get(next).into_iter().flatten() {
            if seen.insert(parent.as_path()) {
                found.push(parent.as_str());
                stack.push(parent.as_path());
            }
        }
    }

    found.sort_unstable();
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site(files: &[(&str, &str)]) -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();

        for (path, text) in files {
            let path = root.join(path);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, text).unwrap();
        }

        (dir, root)
    }

    #[test]
    fn test_flatten_mixed() {
        let value = json!({
            "parents": ["a", { "path": "b", "parents": ["c", ["a", "d"]] }],
            "children": [],
            "count": 3,
        });

        let flat = flatten(&value);
        let expected: HashSet<String> = ["a", "b", "c", "d"].map(String::from).into();
        assert_eq!(flat, expected);
    }

    #[test]
    fn test_flatten_leaf_and_empty() {
        assert_eq!(flatten(&json!("x")), HashSet::from(["x".to_string()]));
        assert!(flatten(&json!(null)).is_empty());
        assert!(flatten(&json!({})).is_empty());
    }

    #[test]
    fn test_scan_nested_parents() {
        let (_dir, root) = site(&[
            ("layouts/head.njk", "<head></head>"),
            ("layouts/base.njk", r#"{% include "layouts/head.njk" %}{% block body %}{% endblock %}"#),
            ("partials/nav.njk", "<nav></nav>"),
            (
                "pages/index.njk",
                r#"{% extends "layouts/base.njk" %}{% block body %}{%- include './nav.njk' %}{% include "partials/nav.njk" %}{% endblock %}"#,
            ),
            ("pages/nav.njk", "local"),
        ]);

        let graph = ScanIncludeGraph::new([root.clone()]);
        let index = graph.query_directory(&root.join("pages")).unwrap();

        let page = root.join("pages/index.njk");
        let entry = &index[&page];
        assert_eq!(entry["parents"].as_array().unwrap().len(), 3);

        let flat = flatten(&entry["ancestors"]);

        for expected in [
            "layouts/base.njk",
            "layouts/head.njk",
            "partials/nav.njk",
            "pages/nav.njk",
        ] {
            assert!(flat.contains(root.join(expected).as_str()), "{expected}");
        }
        assert_eq!(flat.len(), 4);

        // followed outside of the queried directory
        let base = &index[&root.join("layouts/base.njk")];
        assert_eq!(base["children"], json!([page.as_str()]));
    }

    #[test]
    fn test_scan_survives_cycles() {
        let (_dir, root) = site(&[
            ("a.njk", r#"{% include "b.njk" %}"#),
            ("b.njk", r#"{% include "a.njk" %}"#),
        ]);

        let graph = ScanIncludeGraph::new([root.clone()]);
        let found = ancestors(&graph, &root, &root.join("a.njk")).unwrap();
        assert_eq!(found, HashSet::from([root.join("b.njk")]));
    }

    #[test]
    fn test_scan_shared_layers_stay_small() {
        let mut files = vec![("index.njk".to_string(), layer_refs(0))];
        for n in 0..18 {
            let refs = if n < 17 { layer_refs(n + 1) } else { String::new() };
            files.push((format!("l{n}a.njk"), refs.clone()));
            files.push((format!("l{n}b.njk"), refs));
        }
        let files: Vec<(&str, &str)> = files.iter().map(|(p, t)| (p.as_str(), t.as_str())).collect();
        let (_dir, root) = site(&files);

        let graph = ScanIncludeGraph::new([root.clone()]);
        let index = graph.query_directory(&root).unwrap();
        let entry = &index[&root.join("index.njk")];
        assert_eq!(entry["ancestors"].as_array().unwrap().len(), 36);
        assert!(serde_json::to_string(entry).unwrap().len() < 16_384);

        let found = ancestors(&graph, &root, &root.join("index.njk")).unwrap();
        assert_eq!(found.len(), 36);
        assert!(found.contains(&root.join("l17b.njk")));
    }

    fn layer_refs(n: usize) -> String {
        format!(r#"{{% include "l{n}a.njk" %}}{{% include "l{n}b.njk" %}}"#)
    }

    #[test]
    fn test_unresolved_references_are_skipped() {
        let (_dir, root) = site(&[("a.njk", r#"{% include "missing.njk" %}"#)]);

        let graph = ScanIncludeGraph::new([root.clone()]);
        let found = ancestors(&graph, &root, &root.join("a.njk")).unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn test_ancestors_of_unknown_file() {
        let (_dir, root) = site(&[("a.njk", "plain")]);

        let graph = ScanIncludeGraph::new([root.clone()]);
        let found = ancestors(&graph, &root, &root.join("zzz.njk")).unwrap();
        assert!(found.is_empty());
    }
}

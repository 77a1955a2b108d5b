use camino::{Utf8Component, Utf8Path, Utf8PathBuf};

use crate::{MARKUP_EXT, TEMPLATE_EXT};

/// Normalize a path, removing things like `.` and `..`.
///
/// CAUTION: This does not resolve symlinks (unlike [`std::fs::canonicalize`]).
/// This may cause incorrect or surprising behavior at times.
///
/// Adapted from
/// <https://github.com/rust-lang/cargo/blob/f7acf448fc127df9a77c52cc2bba027790ac4931/crates/cargo-util/src/paths.rs#L76-L116>
pub(crate) fn normalize_path(path: &Utf8Path) -> Utf8PathBuf {
    let mut components = path.components().peekable();
    let mut ret = if let Some(c @ Utf8Component::Prefix(..)) = components.peek().cloned() {
        components.next();
        Utf8PathBuf::from(c.as_str())
    } else {
        Utf8PathBuf::new()
    };

    for component in components {
        match component {
            Utf8Component::Prefix(..) => unreachable!(),
            Utf8Component::RootDir => {
                ret.push(Utf8Component::RootDir);
            }
            Utf8Component::CurDir => {}
            Utf8Component::ParentDir => {
                if ret.ends_with(Utf8Component::ParentDir) {
                    ret.push(Utf8Component::ParentDir);
                } else {
                    let popped = ret.pop();
                    if !popped && !ret.has_root() {
                        ret.push(Utf8Component::ParentDir);
                    }
                }
            }
            Utf8Component::Normal(c) => {
                ret.push(c);
            }
        }
    }
    ret
}

/// Makes `path` absolute against the current directory without touching the
/// file system.
pub(crate) fn absolute(path: &Utf8Path) -> std::io::Result<Utf8PathBuf> {
    Utf8PathBuf::try_from(std::path::absolute(path)?).map_err(|err| err.into_io_error())
}

/// Path of `path` as seen from `base`, climbing with `..` when `path` lies
/// outside of `base`. Both paths are expected to be normalized.
pub(crate) fn relative_to(base: &Utf8Path, path: &Utf8Path) -> Utf8PathBuf {
    let base: Vec<_> = base.components().collect();
    let path: Vec<_> = path.components().collect();

    let common = base
        .iter()
        .zip(&path)
        .take_while(|(a, b)| a == b)
        .count();

    let mut ret = Utf8PathBuf::new();
    for _ in common..base.len() {
        ret.push(Utf8Component::ParentDir);
    }
    for component in &path[common..] {
        ret.push(component);
    }
    ret
}

/// Same directory and file stem, with the markup extension.
///
/// `pages/about.njk` -> `pages/about.html`
pub(crate) fn to_markup(path: &str) -> String {
    swap_extension(path, MARKUP_EXT)
}

/// Same directory and file stem, with the template extension.
///
/// `pages/about.html` -> `pages/about.njk`
pub(crate) fn to_template(path: &str) -> String {
    swap_extension(path, TEMPLATE_EXT)
}

pub(crate) fn has_extension(path: impl AsRef<Utf8Path>, ext: &str) -> bool {
    path.as_ref().extension() == Some(ext)
}

// Works on the raw string so that relative ids like `./index.njk` keep their
// exact spelling, which the build adapter relies on for its id map.
fn swap_extension(path: &str, ext: &str) -> String {
    let name_start = path.rfind(['/', '\\']).map_or(0, |i| i + 1);
    let stem_end = match path[name_start..].rfind('.') {
        Some(0) | None => path.len(),
        Some(i) => name_start + i,
    };

    format!("{}.{}", &path[..stem_end], ext)
}

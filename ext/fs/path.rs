// Copyright 2018-2026 the Deno authors. MIT license.

use std::fmt::Debug;
use std::path::Component;
use std::path::Path;
use std::path::PathBuf;

use skiff_core::OsError;

use crate::FsResult;

/// Maps the paths scripts see onto real paths. Translation may deny access,
/// which is reported as not-found for the logical path.
pub trait PathTranslator: Debug + Send + Sync + 'static {
  fn translate(&self, path: &Path) -> Option<PathBuf>;

  /// Map a real path back into the script's view, if it is visible there.
  fn reverse(&self, real: &Path) -> Option<PathBuf>;

  fn resolve(&self, path: &Path) -> FsResult<PathBuf> {
    self
      .translate(path)
      .ok_or_else(|| OsError::not_found().path(path))
  }
}

/// No sandbox: logical paths are real paths.
#[derive(Debug, Default)]
pub struct IdentityTranslator;

impl PathTranslator for IdentityTranslator {
  fn translate(&self, path: &Path) -> Option<PathBuf> {
    Some(path.to_path_buf())
  }

  fn reverse(&self, real: &Path) -> Option<PathBuf> {
    Some(real.to_path_buf())
  }
}

/// Confines scripts below `root`. Relative paths resolve against the
/// logical working directory, and `mount` grafts a real directory onto a
/// logical prefix, the way mount(8) does.
#[derive(Debug)]
pub struct RootedTranslator {
  root: PathBuf,
  working_dir: PathBuf,
  mounts: Vec<(PathBuf, PathBuf)>,
}

impl RootedTranslator {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self {
      root: root.into(),
      working_dir: PathBuf::from("/"),
      mounts: Vec::new(),
    }
  }

  pub fn with_working_dir(mut self, working_dir: impl Into<PathBuf>) -> Self {
    self.working_dir = working_dir.into();
    self
  }

  pub fn mount(
    mut self,
    prefix: impl Into<PathBuf>,
    real: impl Into<PathBuf>,
  ) -> Self {
    self.mounts.push((prefix.into(), real.into()));
    self
  }

  pub fn root(&self) -> &Path {
    &self.root
  }
}

/// Collapse `.` and `..` lexically. Returns the components below the
/// logical root, or None when `..` would climb above it.
fn normalize(path: &Path) -> Option<PathBuf> {
  let mut normalized = PathBuf::new();
  for component in path.components() {
    match component {
      Component::Prefix(_) | Component::RootDir | Component::CurDir => {}
      Component::ParentDir => {
        if !normalized.pop() {
          return None;
        }
      }
      Component::Normal(part) => normalized.push(part),
    }
  }
  Some(normalized)
}

impl PathTranslator for RootedTranslator {
  fn translate(&self, path: &Path) -> Option<PathBuf> {
    let absolute = if path.has_root() {
      path.to_path_buf()
    } else {
      self.working_dir.join(path)
    };
    let Some(logical) = normalize(&absolute) else {
      log::debug!("{} tries to escape root", path.display());
      return None;
    };

    // the deepest matching mount wins, whatever order they were added in
    let mount = self
      .mounts
      .iter()
      .filter_map(|(prefix, real)| {
        let prefix = normalize(prefix)?;
        let depth = prefix.components().count();
        let rest = logical.strip_prefix(&prefix).ok()?.to_path_buf();
        Some((depth, real, rest))
      })
      .max_by_key(|(depth, _, _)| *depth);
    if let Some((_, real, rest)) = mount {
      return Some(real.join(rest));
    }

    let real = self.root.join(&logical);
    log::trace!("translate: {} -> {}", path.display(), real.display());
    Some(real)
  }

  fn reverse(&self, real: &Path) -> Option<PathBuf> {
    // the deepest matching mount wins
    let mount = self
      .mounts
      .iter()
      .filter_map(|(prefix, mount_real)| {
        real
          .strip_prefix(mount_real)
          .ok()
          .map(|rest| (prefix, mount_real, rest))
      })
      .max_by_key(|(_, mount_real, _)| mount_real.components().count());
    if let Some((prefix, _, rest)) = mount {
      return Some(Path::new("/").join(prefix).join(rest));
    }

    let rest = real.strip_prefix(&self.root).ok()?;
    Some(Path::new("/").join(rest))
  }
}

#[cfg(test)]
mod tests {
  use pretty_assertions::assert_eq;

  use super::*;

  #[test]
  fn rooted_paths_stay_under_root() {
    let translator =
      RootedTranslator::new("/srv/app").with_working_dir("/home");
    assert_eq!(
      translator.translate(Path::new("/etc/config.json")),
      Some(PathBuf::from("/srv/app/etc/config.json"))
    );
    assert_eq!(
      translator.translate(Path::new("data/../notes.txt")),
      Some(PathBuf::from("/srv/app/home/notes.txt"))
    );
  }

  #[test]
  fn escaping_root_is_denied() {
    let translator = RootedTranslator::new("/srv/app");
    assert_eq!(translator.translate(Path::new("/../etc/passwd")), None);
    assert_eq!(translator.translate(Path::new("/a/../../b")), None);
    let err = translator.resolve(Path::new("/../x")).unwrap_err();
    assert_eq!(err.code(), skiff_core::ErrorCode::NotFound);
  }

  #[test]
  fn mounts_take_precedence() {
    let translator =
      RootedTranslator::new("/srv/app").mount("/usr/lib/bar", "/opt/bar");
    assert_eq!(
      translator.translate(Path::new("/usr/lib/bar/x.js")),
      Some(PathBuf::from("/opt/bar/x.js"))
    );
    assert_eq!(
      translator.reverse(Path::new("/opt/bar/x.js")),
      Some(PathBuf::from("/usr/lib/bar/x.js"))
    );
  }

  #[test]
  fn nested_mount_wins_over_outer_one() {
    let translator = RootedTranslator::new("/srv/app")
      .mount("/usr", "/opt/usr")
      .mount("/usr/lib", "/opt/lib");
    assert_eq!(
      translator.translate(Path::new("/usr/lib/x.js")),
      Some(PathBuf::from("/opt/lib/x.js"))
    );
    assert_eq!(
      translator.translate(Path::new("/usr/share/y")),
      Some(PathBuf::from("/opt/usr/share/y"))
    );
    assert_eq!(
      translator.translate(Path::new("/usr")),
      Some(PathBuf::from("/opt/usr"))
    );
  }

  #[test]
  fn reverse_hides_real_root() {
    let translator = RootedTranslator::new("/srv/app");
    assert_eq!(
      translator.reverse(Path::new("/srv/app/a/b")),
      Some(PathBuf::from("/a/b"))
    );
    assert_eq!(translator.reverse(Path::new("/elsewhere")), None);
  }

  #[test]
  fn identity_passes_through() {
    let translator = IdentityTranslator;
    assert_eq!(
      translator.translate(Path::new("../x")),
      Some(PathBuf::from("../x"))
    );
  }
}

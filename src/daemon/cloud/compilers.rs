// Copyright 2021 The yadcc developers
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Which compilers this machine can offer the cloud. Compilers are
//! identified by the content digest of their binary; the servant only ever
//! runs a compiler whose digest the requestor asked for.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use protocol::EnvironmentDesc;
use util;

lazy_static! {
    static ref COMPILER_EXECUTABLES: Vec<&'static str> =
        vec!["gcc", "g++", "clang", "clang++"];
    // Wrappers provided by ccache / distcc / icecc are not compilers.
    static ref COMPILER_WRAPPERS: Vec<&'static str> = vec!["ccache", "distcc", "icecc"];
}

pub struct CompilerRegistry {
    // digest -> canonical path.
    compiler_paths: HashMap<String, String>,
    environments: Vec<EnvironmentDesc>,
}

// Canonical path if `path` is executable by us.
fn canonical_path_if_executable(path: &Path) -> Option<PathBuf> {
    let metadata = fs::metadata(path).ok()?;
    if !metadata.is_file() || metadata.permissions().mode() & 0o111 == 0 {
        return None;
    }
    path.canonicalize().ok()
}

fn is_compiler_wrapper(path: &Path) -> bool {
    let name = match path.file_name().and_then(|n| n.to_str()) {
        Some(n) => n,
        None => return false,
    };
    COMPILER_WRAPPERS.iter().any(|w| name.ends_with(w))
}

fn lookup_compilers_in(dir: &str) -> Vec<PathBuf> {
    let mut found = Vec::new();
    for executable in COMPILER_EXECUTABLES.iter() {
        let candidate = Path::new(dir).join(executable);
        if let Some(path) = canonical_path_if_executable(&candidate) {
            if !is_compiler_wrapper(&path) {
                found.push(path);
            }
        }
    }
    found
}

impl CompilerRegistry {
    /// Discovers compilers in `extra_dirs`, `$PATH` and the usual RHEL
    /// devtoolset locations.
    pub fn discover(extra_dirs: &[String]) -> CompilerRegistry {
        let mut registry = CompilerRegistry {
            compiler_paths: HashMap::new(),
            environments: Vec::new(),
        };
        for dir in extra_dirs {
            for path in lookup_compilers_in(dir) {
                registry.register_environment(&path);
            }
        }
        if let Ok(path_var) = env::var("PATH") {
            for dir in path_var.split(':') {
                for path in lookup_compilers_in(dir) {
                    registry.register_environment(&path);
                }
            }
        }
        for i in 1..100 {
            for path in lookup_compilers_in(&format!("/opt/rh/devtoolset-{}/root/bin", i)) {
                registry.register_environment(&path);
            }
        }
        registry
    }

    /// Registry over an explicit list of binaries; configuration and tests.
    pub fn with_compilers(paths: &[PathBuf]) -> CompilerRegistry {
        let mut registry = CompilerRegistry {
            compiler_paths: HashMap::new(),
            environments: Vec::new(),
        };
        for path in paths {
            registry.register_environment(path);
        }
        registry
    }

    pub fn enumerate_environments(&self) -> Vec<EnvironmentDesc> {
        self.environments.clone()
    }

    pub fn try_get_compiler_path(&self, env: &EnvironmentDesc) -> Option<String> {
        self.compiler_paths.get(&env.compiler_digest).cloned()
    }

    fn register_environment(&mut self, path: &Path) {
        let digest = match util::Digest::file(path) {
            Ok(d) => d,
            Err(e) => {
                warn!("Failed to hash compiler [{:?}]: {}", path, e);
                return;
            }
        };
        if !self.compiler_paths.contains_key(&digest) {
            info!("Found compiler: {}", path.display());
            self.compiler_paths
                .insert(digest.clone(), path.to_string_lossy().into_owned());
            self.environments.push(EnvironmentDesc::new(&digest));
        } // Duplicates (e.g. symlinked binaries) are ignored silently.
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;
    use tempdir::TempDir;

    fn fake_compiler(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(body.as_bytes()).unwrap();
        let mut permissions = f.metadata().unwrap().permissions();
        permissions.set_mode(0o755);
        fs::set_permissions(&path, permissions).unwrap();
        path
    }

    #[test]
    fn test_registry_round_trip() {
        let tmp = TempDir::new("compilers").unwrap();
        let gcc = fake_compiler(tmp.path(), "gcc", "#!/bin/sh\nexit 0\n");
        let registry = CompilerRegistry::with_compilers(&[gcc.clone()]);

        let environments = registry.enumerate_environments();
        assert_eq!(environments.len(), 1);
        assert_eq!(
            registry.try_get_compiler_path(&environments[0]).unwrap(),
            gcc.to_string_lossy().into_owned()
        );
        assert!(registry
            .try_get_compiler_path(&EnvironmentDesc::new("no-such-digest"))
            .is_none());
    }

    #[test]
    fn test_discovery_skips_wrappers_and_non_executables() {
        let tmp = TempDir::new("compilers").unwrap();
        fake_compiler(tmp.path(), "gcc", "#!/bin/sh\nexit 0\n");
        // A ccache symlink-alike and a non-executable file must be ignored.
        fs::write(tmp.path().join("g++"), "not executable").unwrap();
        let dir = tmp.path().to_string_lossy().into_owned();
        let found = lookup_compilers_in(&dir);
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn test_identical_binaries_register_once() {
        let tmp = TempDir::new("compilers").unwrap();
        let a = fake_compiler(tmp.path(), "gcc", "#!/bin/sh\nexit 0\n");
        let b = fake_compiler(tmp.path(), "g++", "#!/bin/sh\nexit 0\n");
        let registry = CompilerRegistry::with_compilers(&[a, b]);
        assert_eq!(registry.enumerate_environments().len(), 1);
    }
}

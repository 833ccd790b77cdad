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

//! Sandbox directories for remote compilations. The output path is padded
//! with filler directories to nearly `PATH_MAX`: whatever absolute path the
//! requestor needs to see can later be patched over ours in place, since
//! ours is at least as long.

use std::fs;
use std::path::Path;
use tempdir::TempDir;

use errors::*;
use protocol::{PatchLocation, PatchLocations};

const PATH_MAX: usize = 4096;
const NAME_MAX: usize = 255;
/// Slack left for the output file name and the requestor's own use.
const RESERVED_TAIL: usize = 30;

pub struct Workspace {
    dir: TempDir,
    output_dir: String,
}

impl Workspace {
    /// Creates the workspace; `salt` keeps concurrent tasks apart and makes
    /// the path recognizable in diagnostics.
    pub fn new(salt: &str) -> Result<Workspace> {
        let dir = TempDir::new("yadcc").chain_err(|| "failed to create workspace")?;
        let limit = PATH_MAX - RESERVED_TAIL;
        let mut path = format!("{}/{}", dir.path().display(), salt);
        while path.len() + 2 < limit {
            let segment = ::std::cmp::min(NAME_MAX, limit - path.len() - 2);
            path.push('/');
            for _ in 0..segment {
                path.push('A');
            }
        }
        fs::create_dir_all(&path)
            .chain_err(|| format!("failed to create workspace directories under {:?}", dir.path()))?;
        Ok(Workspace { dir, output_dir: path })
    }

    /// The directory compiler outputs land in.
    pub fn output_dir(&self) -> &str {
        &self.output_dir
    }

    /// Absolute path prefix of every output file, `<output_dir>/output`.
    /// This is the string to look for when computing patch locations.
    pub fn output_prefix(&self) -> String {
        format!("{}/output", self.output_dir)
    }

    /// Collects `(extension, bytes)` of every file the compiler produced,
    /// e.g. `(".o", …)` for `output.o`.
    pub fn read_outputs(&self) -> Result<Vec<(String, Vec<u8>)>> {
        let mut outputs = Vec::new();
        for item in fs::read_dir(&self.output_dir)? {
            let item = item?;
            let name = item.file_name().to_string_lossy().into_owned();
            if !name.starts_with("output") || !item.file_type()?.is_file() {
                warn!("File [{}] is found in the workspace unexpectedly.", name);
                continue;
            }
            let extension = name["output".len()..].to_owned();
            let bytes = fs::read(item.path())?;
            outputs.push((extension, bytes));
        }
        outputs.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(outputs)
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

/// Finds every occurrence of `prefix` in `bytes` that begins a
/// null-terminated string (the form compilers embed paths in). The
/// requestor patches those ranges with its own path.
pub fn find_path_locations(bytes: &[u8], prefix: &str) -> PatchLocations {
    assert!(!prefix.is_empty());
    let prefix = prefix.as_bytes();
    let mut locations = PatchLocations::default();
    let mut start = 0usize;
    while start + prefix.len() <= bytes.len() {
        let pos = match find_subsequence(&bytes[start..], prefix) {
            Some(offset) => start + offset,
            None => break,
        };
        let end = match bytes[pos..].iter().position(|&b| b == 0) {
            Some(offset) => pos + offset,
            None => {
                warn!(
                    "Unexpected: Our path prefix matches, yet it's not a null-terminated \
                     string. Skipping."
                );
                break;
            }
        };
        if end - pos > PATH_MAX {
            start = end;
            continue;
        }
        locations.locations.push(PatchLocation {
            position: pos as u64,
            total_size: (end - pos) as u64,
            suffix_to_keep: (end - pos - prefix.len()) as u64,
        });
        start = end;
    }
    locations
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    (0..=haystack.len() - needle.len()).find(|&i| haystack[i..i + needle.len()] == *needle)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_workspace_path_is_padded_to_near_path_max() {
        let workspace = Workspace::new("0123abcd").unwrap();
        let len = workspace.output_dir().len();
        assert!(len >= PATH_MAX - RESERVED_TAIL - NAME_MAX - 2, "{}", len);
        assert!(len < PATH_MAX - RESERVED_TAIL, "{}", len);
        assert!(Path::new(workspace.output_dir()).is_dir());
    }

    #[test]
    fn test_read_outputs() {
        let workspace = Workspace::new("salt").unwrap();
        fs::File::create(format!("{}/output.o", workspace.output_dir()))
            .unwrap()
            .write_all(b"OBJ")
            .unwrap();
        fs::File::create(format!("{}/output.d", workspace.output_dir()))
            .unwrap()
            .write_all(b"DEP")
            .unwrap();
        let outputs = workspace.read_outputs().unwrap();
        assert_eq!(
            outputs,
            vec![
                (".d".to_owned(), b"DEP".to_vec()),
                (".o".to_owned(), b"OBJ".to_vec())
            ]
        );
    }

    #[test]
    fn test_find_path_locations() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"leading junk\0");
        bytes.extend_from_slice(b"/ws/output.o\0");
        bytes.extend_from_slice(b"middle");
        bytes.extend_from_slice(b"/ws/output.d\0trailing");
        let locations = find_path_locations(&bytes, "/ws/output");
        assert_eq!(locations.locations.len(), 2);
        assert_eq!(locations.locations[0].position, 13);
        assert_eq!(locations.locations[0].total_size, 12);
        assert_eq!(locations.locations[0].suffix_to_keep, 2);
        assert_eq!(locations.locations[1].suffix_to_keep, 2);
    }

    #[test]
    fn test_find_path_locations_without_terminator() {
        let locations = find_path_locations(b"/ws/output.o not terminated", "/ws/output");
        // Not null-terminated: reported as nothing rather than garbage.
        assert!(locations.locations.is_empty());
    }
}

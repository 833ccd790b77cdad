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

use errors::*;

/// Parses a size with an optional `K` / `M` / `G` suffix ("10G", "512M").
pub fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim();
    if s.is_empty() {
        bail!(ErrorKind::InvalidArgument("empty size".into()));
    }
    let (digits, multiplier) = match s.as_bytes()[s.len() - 1] {
        b'K' | b'k' => (&s[..s.len() - 1], 1u64 << 10),
        b'M' | b'm' => (&s[..s.len() - 1], 1u64 << 20),
        b'G' | b'g' => (&s[..s.len() - 1], 1u64 << 30),
        _ => (s, 1),
    };
    let value: u64 = digits
        .parse()
        .chain_err(|| ErrorKind::InvalidArgument(format!("invalid size [{}]", s)))?;
    Ok(value * multiplier)
}

/// What to do, on startup, with an entry found in a directory the current
/// shard set would not map it to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MisplacedEntryAction {
    Delete,
    Move,
    Ignore,
}

pub fn parse_misplaced_entry_action(s: &str) -> Result<MisplacedEntryAction> {
    match s {
        "delete" => Ok(MisplacedEntryAction::Delete),
        "move" => Ok(MisplacedEntryAction::Move),
        "ignore" => Ok(MisplacedEntryAction::Ignore),
        _ => bail!(ErrorKind::InvalidArgument(format!(
            "invalid action on misplaced cache entry [{}]",
            s
        ))),
    }
}

/// Parses the shard-directory config, `"size1,path1:size2,path2:..."`.
pub fn parse_cache_dirs(s: &str) -> Result<Vec<(String, u64)>> {
    let mut result = Vec::new();
    for part in s.split(':') {
        let mut kv = part.splitn(2, ',');
        let size = kv
            .next()
            .ok_or_else(|| ErrorKind::InvalidArgument(format!("invalid directory [{}]", part)))?;
        let path = kv
            .next()
            .ok_or_else(|| ErrorKind::InvalidArgument(format!("invalid directory [{}]", part)))?;
        if path.is_empty() {
            bail!(ErrorKind::InvalidArgument(format!(
                "invalid directory [{}]",
                part
            )));
        }
        let size = parse_size(size)?;
        info!(
            "Using directory [{}] to store cache entries. We'll be using up to {} bytes \
             (soft limit) here.",
            path, size
        );
        result.push((path.to_owned(), size));
    }
    Ok(result)
}

/// Parses a comma-separated token list into the set recognized by a
/// `TokenVerifier`.
pub fn parse_token_list(s: &str) -> Vec<String> {
    s.split(',').map(|t| t.to_owned()).collect()
}

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

//! Body framing for the local HTTP protocol: several byte parts are
//! concatenated after a header line listing their sizes in decimal ASCII,
//! `"size1,size2,...,sizeN\r\n"`.

/// Concatenates `parts` into one multi-chunk body. Empty input produces an
/// empty body.
pub fn make_multi_chunk(parts: &[&[u8]]) -> Vec<u8> {
    if parts.is_empty() {
        return Vec::new();
    }
    let sizes: Vec<String> = parts.iter().map(|p| p.len().to_string()).collect();
    let mut result = sizes.join(",").into_bytes();
    result.push(b'\r');
    result.push(b'\n');
    for p in parts {
        result.extend_from_slice(p);
    }
    result
}

/// Splits a multi-chunk body back into its parts. Returns `None` if the
/// header is malformed or the sizes don't add up to the body.
pub fn try_parse_multi_chunk(bytes: &[u8]) -> Option<Vec<&[u8]>> {
    if bytes.is_empty() {
        return Some(Vec::new());
    }
    let newline = bytes.iter().position(|&b| b == b'\n')?;
    if newline == 0 || bytes[newline - 1] != b'\r' {
        return None;
    }
    let header = ::std::str::from_utf8(&bytes[..newline - 1]).ok()?;
    let mut sizes = Vec::new();
    let mut total = 0usize;
    for part in header.split(',') {
        let size: usize = part.parse().ok()?;
        sizes.push(size);
        total = total.checked_add(size)?;
    }
    let mut rest = &bytes[newline + 1..];
    if rest.len() != total {
        return None;
    }
    let mut result = Vec::with_capacity(sizes.len());
    for size in sizes {
        let (part, remaining) = rest.split_at(size);
        result.push(part);
        rest = remaining;
    }
    Some(result)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_round_trip() {
        let body = make_multi_chunk(&[b"hello", b"", b"world!"]);
        assert_eq!(&body[..], &b"5,0,6\r\nhelloworld!"[..]);
        let parts = try_parse_multi_chunk(&body).unwrap();
        assert_eq!(parts, vec![&b"hello"[..], &b""[..], &b"world!"[..]]);
    }

    #[test]
    fn test_empty() {
        assert_eq!(make_multi_chunk(&[]), Vec::<u8>::new());
        assert_eq!(try_parse_multi_chunk(b"").unwrap().len(), 0);
    }

    #[test]
    fn test_malformed() {
        assert!(try_parse_multi_chunk(b"5\nhello").is_none()); // No CR.
        assert!(try_parse_multi_chunk(b"5,4\r\nhello").is_none()); // Sizes don't add up.
        assert!(try_parse_multi_chunk(b"x\r\nabc").is_none()); // Non-numeric.
        assert!(try_parse_multi_chunk(b"no header at all").is_none());
    }
}

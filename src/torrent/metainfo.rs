//! Torrent Metainfo Parser
//!
//! Parses .torrent files (BEP 3): file layout, piece geometry, per-piece
//! SHA-1 digests, and tracker URLs. The parsed descriptor is everything
//! the download table needs to initialize.

use std::path::{Path, PathBuf};

use sha1::{Digest, Sha1};

use super::bencode::{find_info_dict_bytes, BencodeValue};
use super::wire::Sha1Hash;
use crate::error::{EngineError, ProtocolErrorKind, Result};

/// Parsed torrent metainfo
#[derive(Debug, Clone)]
pub struct Metainfo {
    /// SHA-1 of the bencoded info dictionary
    pub info_hash: Sha1Hash,
    /// The parsed info dictionary
    pub info: Info,
    /// Primary announce URL
    pub announce: Option<String>,
    /// Announce list (BEP 12): tiers of tracker URLs
    pub announce_list: Vec<Vec<String>>,
}

/// The info dictionary
#[derive(Debug, Clone)]
pub struct Info {
    /// Suggested name for the file or directory
    pub name: String,
    /// Bytes per piece (the final piece may be shorter)
    pub piece_length: u64,
    /// Per-piece SHA-1 digests
    pub pieces: Vec<Sha1Hash>,
    /// Files in stream order
    pub files: Vec<FileInfo>,
    /// Total size of all files
    pub total_size: u64,
    /// Single-file torrent (name is the file) vs multi-file (name is a
    /// directory)
    pub is_single_file: bool,
}

/// One file within the torrent
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Path relative to the torrent directory
    pub path: PathBuf,
    /// File size in bytes
    pub length: u64,
    /// Byte offset within the concatenated file stream
    pub offset: u64,
}

impl Metainfo {
    /// Parse a .torrent file from bytes.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let root = BencodeValue::parse_exact(data)?;
        if root.as_dict().is_none() {
            return Err(EngineError::protocol(
                ProtocolErrorKind::InvalidTorrent,
                "Root must be a dictionary",
            ));
        }

        // The info-hash is computed over the raw info-dict bytes
        let info_bytes = find_info_dict_bytes(data)?;
        let mut hasher = Sha1::new();
        hasher.update(info_bytes);
        let info_hash: Sha1Hash = hasher.finalize().into();

        let info_value = root.get("info").ok_or_else(|| {
            EngineError::protocol(ProtocolErrorKind::InvalidTorrent, "Missing 'info' key")
        })?;
        let info = Self::parse_info(info_value)?;

        let announce = root
            .get("announce")
            .and_then(|v| v.as_string())
            .map(String::from);

        let announce_list = root
            .get("announce-list")
            .and_then(|v| v.as_list())
            .map(|tiers| {
                tiers
                    .iter()
                    .filter_map(|tier| {
                        tier.as_list().map(|urls| {
                            urls.iter()
                                .filter_map(|u| u.as_string().map(String::from))
                                .collect::<Vec<_>>()
                        })
                    })
                    .filter(|tier| !tier.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            info_hash,
            info,
            announce,
            announce_list,
        })
    }

    fn parse_info(value: &BencodeValue) -> Result<Info> {
        let invalid = |msg: &str| EngineError::protocol(ProtocolErrorKind::InvalidTorrent, msg);

        if value.as_dict().is_none() {
            return Err(invalid("'info' must be a dictionary"));
        }

        let name = value
            .get("name")
            .and_then(|v| v.as_string())
            .ok_or_else(|| invalid("Missing 'name' in info"))?
            .to_string();

        let piece_length = value
            .get("piece length")
            .and_then(|v| v.as_uint())
            .ok_or_else(|| invalid("Missing or invalid 'piece length'"))?;
        if piece_length == 0 {
            return Err(invalid("'piece length' must be greater than zero"));
        }

        let pieces_bytes = value
            .get("pieces")
            .and_then(|v| v.as_bytes())
            .ok_or_else(|| invalid("Missing 'pieces'"))?;
        if pieces_bytes.len() % 20 != 0 {
            return Err(invalid("'pieces' length is not a multiple of 20"));
        }

        let pieces: Vec<Sha1Hash> = pieces_bytes
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();

        let (files, total_size, is_single_file) = match value.get("files") {
            Some(files_value) => {
                let (files, total) = Self::parse_files(files_value)?;
                (files, total, false)
            }
            None => {
                let length = value
                    .get("length")
                    .and_then(|v| v.as_uint())
                    .ok_or_else(|| invalid("Missing 'length' for single-file torrent"))?;
                let file = FileInfo {
                    path: PathBuf::from(&name),
                    length,
                    offset: 0,
                };
                (vec![file], length, true)
            }
        };

        let expected_pieces = total_size.div_ceil(piece_length);
        if pieces.len() as u64 != expected_pieces {
            return Err(invalid(&format!(
                "Piece count mismatch: have {}, expected {} for {} bytes at {} per piece",
                pieces.len(),
                expected_pieces,
                total_size,
                piece_length
            )));
        }

        Ok(Info {
            name,
            piece_length,
            pieces,
            files,
            total_size,
            is_single_file,
        })
    }

    fn parse_files(value: &BencodeValue) -> Result<(Vec<FileInfo>, u64)> {
        let invalid = |msg: &str| EngineError::protocol(ProtocolErrorKind::InvalidTorrent, msg);

        let entries = value.as_list().ok_or_else(|| invalid("'files' must be a list"))?;

        let mut files = Vec::new();
        let mut offset = 0u64;

        for entry in entries {
            let length = entry
                .get("length")
                .and_then(|v| v.as_uint())
                .ok_or_else(|| invalid("Missing 'length' in file entry"))?;

            let components = entry
                .get("path")
                .and_then(|v| v.as_list())
                .ok_or_else(|| invalid("Missing 'path' in file entry"))?;

            let mut path = PathBuf::new();
            for component in components {
                let text = component
                    .as_string()
                    .ok_or_else(|| invalid("Path component must be a string"))?;
                path.push(text);
            }

            files.push(FileInfo {
                path,
                length,
                offset,
            });
            offset += length;
        }

        Ok((files, offset))
    }

    /// Read and parse a .torrent file from disk.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let data = tokio::fs::read(path.as_ref()).await?;
        Self::parse(&data)
    }

    /// Info-hash as lowercase hex.
    pub fn info_hash_hex(&self) -> String {
        self.info_hash.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Info-hash percent-encoded for tracker query strings.
    pub fn info_hash_urlencoded(&self) -> String {
        self.info_hash.iter().map(|b| format!("%{:02X}", b)).collect()
    }

    /// Digest for a piece.
    pub fn piece_hash(&self, index: usize) -> Option<&Sha1Hash> {
        self.info.pieces.get(index)
    }

    /// Byte range `[start, end)` of a piece within the content stream.
    pub fn piece_range(&self, index: usize) -> Option<(u64, u64)> {
        if index >= self.info.pieces.len() {
            return None;
        }
        let start = index as u64 * self.info.piece_length;
        let end = (start + self.info.piece_length).min(self.info.total_size);
        Some((start, end))
    }

    /// Length of a piece (final piece may be shorter).
    pub fn piece_length(&self, index: usize) -> Option<u64> {
        self.piece_range(index).map(|(start, end)| end - start)
    }

    /// All tracker URLs: primary announce plus flattened announce-list,
    /// deduplicated, in tier order.
    pub fn all_trackers(&self) -> Vec<String> {
        let mut trackers = Vec::new();
        if let Some(announce) = &self.announce {
            trackers.push(announce.clone());
        }
        for tier in &self.announce_list {
            for url in tier {
                if !trackers.contains(url) {
                    trackers.push(url.clone());
                }
            }
        }
        trackers
    }

    /// Files overlapping a byte range of the content stream.
    ///
    /// Returns (file index, offset within that file, length) tuples
    /// covering the range in stream order.
    pub fn files_for_range(&self, start: u64, end: u64) -> Vec<(usize, u64, u64)> {
        let mut result = Vec::new();

        for (index, file) in self.info.files.iter().enumerate() {
            let file_start = file.offset;
            let file_end = file.offset + file.length;

            if file_start >= end || file_end <= start {
                continue;
            }

            let overlap_start = start.max(file_start);
            let overlap_end = end.min(file_end);

            result.push((index, overlap_start - file_start, overlap_end - overlap_start));
        }

        result
    }
}

//! Piece storage
//!
//! The download core persists verified pieces and serves block reads for
//! uploading through this interface. `FileStorage` is the file-backed
//! implementation: pieces map onto byte ranges of the torrent's files,
//! and `current_state` re-checks existing content at startup so pieces
//! already on disk are not downloaded again.

use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bitvec::prelude::*;
use sha1::{Digest, Sha1};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use super::metainfo::Metainfo;
use super::wire::Sha1Hash;
use crate::error::{EngineError, ProtocolErrorKind, Result, StorageErrorKind};

/// What the disk already holds, discovered once at startup
#[derive(Debug, Clone)]
pub struct DiskState {
    /// Bit per piece; set iff the on-disk bytes match the piece digest
    pub have: BitVec<u8, Msb0>,
    /// Every piece is present
    pub completed: bool,
    /// Bytes still missing
    pub bytes_left: u64,
}

/// Storage interface consumed by the download core
#[async_trait]
pub trait Storage: Send + Sync {
    /// Read a block out of a piece we hold, for uploading to a peer.
    async fn read_block(&self, piece: u32, begin: u32, length: u32) -> Result<Vec<u8>>;

    /// Persist a verified piece.
    async fn write_piece(&self, piece: u32, data: &[u8]) -> Result<()>;

    /// Scan existing files and report which pieces are already valid.
    async fn current_state(&self) -> Result<DiskState>;
}

/// File-backed storage for a torrent's content
pub struct FileStorage {
    metainfo: Arc<Metainfo>,
    save_dir: PathBuf,
}

impl FileStorage {
    pub fn new(metainfo: Arc<Metainfo>, save_dir: PathBuf) -> Self {
        Self { metainfo, save_dir }
    }

    /// Reject path components that would escape the save directory.
    fn validate_component(component: &Component) -> Result<()> {
        match component {
            Component::ParentDir => Err(EngineError::storage(
                StorageErrorKind::PathTraversal,
                PathBuf::new(),
                "file path contains parent directory reference",
            )),
            Component::RootDir | Component::Prefix(_) => Err(EngineError::storage(
                StorageErrorKind::PathTraversal,
                PathBuf::new(),
                "file path is absolute",
            )),
            _ => Ok(()),
        }
    }

    /// Build the on-disk path for a file index, validating every component.
    fn file_path(&self, file_index: usize) -> Result<PathBuf> {
        let info = &self.metainfo.info;
        let file = &info.files[file_index];

        for component in Path::new(&info.name).components() {
            Self::validate_component(&component)?;
        }

        if info.is_single_file {
            return Ok(self.save_dir.join(&info.name));
        }

        for component in file.path.components() {
            Self::validate_component(&component)?;
        }
        Ok(self.save_dir.join(&info.name).join(&file.path))
    }

    /// Read an absolute byte range of the content stream, spanning files.
    /// Returns None if any file is missing or shorter than required.
    async fn read_range(&self, start: u64, end: u64) -> Result<Option<Vec<u8>>> {
        let mut data = Vec::with_capacity((end - start) as usize);

        for (file_index, file_offset, length) in self.metainfo.files_for_range(start, end) {
            let path = self.file_path(file_index)?;

            let mut file = match File::open(&path).await {
                Ok(f) => f,
                Err(_) => return Ok(None),
            };

            file.seek(SeekFrom::Start(file_offset)).await?;
            let mut buf = vec![0u8; length as usize];
            match file.read_exact(&mut buf).await {
                Ok(_) => data.extend_from_slice(&buf),
                Err(_) => return Ok(None),
            }
        }

        Ok(Some(data))
    }

    async fn verify_piece_on_disk(&self, index: usize, expected: &Sha1Hash) -> Result<bool> {
        let Some((start, end)) = self.metainfo.piece_range(index) else {
            return Ok(false);
        };

        match self.read_range(start, end).await? {
            Some(data) => {
                let mut hasher = Sha1::new();
                hasher.update(&data);
                let actual: Sha1Hash = hasher.finalize().into();
                Ok(actual == *expected)
            }
            None => Ok(false),
        }
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn read_block(&self, piece: u32, begin: u32, length: u32) -> Result<Vec<u8>> {
        let piece_length = self.metainfo.piece_length(piece as usize).ok_or_else(|| {
            EngineError::protocol(
                ProtocolErrorKind::PeerProtocol,
                format!("Invalid piece index {}", piece),
            )
        })?;

        if begin as u64 + length as u64 > piece_length {
            return Err(EngineError::protocol(
                ProtocolErrorKind::PeerProtocol,
                format!(
                    "Block read out of bounds: begin={}, length={}, piece_length={}",
                    begin, length, piece_length
                ),
            ));
        }

        let start = piece as u64 * self.metainfo.info.piece_length + begin as u64;
        let end = start + length as u64;

        match self.read_range(start, end).await? {
            Some(data) => Ok(data),
            None => Err(EngineError::storage(
                StorageErrorKind::NotFound,
                &self.save_dir,
                format!("Block data missing on disk for piece {}", piece),
            )),
        }
    }

    async fn write_piece(&self, piece: u32, data: &[u8]) -> Result<()> {
        let (start, end) = self.metainfo.piece_range(piece as usize).ok_or_else(|| {
            EngineError::Internal(format!("write_piece: piece {} out of range", piece))
        })?;

        if data.len() as u64 != end - start {
            return Err(EngineError::Internal(format!(
                "write_piece: piece {} has {} bytes, expected {}",
                piece,
                data.len(),
                end - start
            )));
        }

        let mut data_offset = 0usize;
        for (file_index, file_offset, length) in self.metainfo.files_for_range(start, end) {
            let path = self.file_path(file_index)?;

            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }

            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)
                .await
                .map_err(|e| {
                    EngineError::storage(StorageErrorKind::Io, &path, e.to_string())
                })?;

            file.seek(SeekFrom::Start(file_offset)).await?;
            let write_end = data_offset + length as usize;
            file.write_all(&data[data_offset..write_end]).await.map_err(|e| {
                EngineError::storage(StorageErrorKind::Io, &path, e.to_string())
            })?;
            data_offset = write_end;
        }

        Ok(())
    }

    async fn current_state(&self) -> Result<DiskState> {
        let num_pieces = self.metainfo.info.pieces.len();
        let mut have = bitvec![u8, Msb0; 0; num_pieces];
        let mut bytes_left = 0u64;

        for index in 0..num_pieces {
            let expected = &self.metainfo.info.pieces[index];
            if self.verify_piece_on_disk(index, expected).await? {
                have.set(index, true);
            } else {
                bytes_left += self.metainfo.piece_length(index).unwrap_or(0);
            }
        }

        let completed = have.count_ones() == num_pieces;
        Ok(DiskState {
            have,
            completed,
            bytes_left,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::metainfo::{FileInfo, Info};

    fn sha1(data: &[u8]) -> Sha1Hash {
        let mut hasher = Sha1::new();
        hasher.update(data);
        hasher.finalize().into()
    }

    /// Two files (60 + 40 bytes) under a directory, 64-byte pieces.
    fn multi_file_metainfo(content: &[u8]) -> Metainfo {
        assert_eq!(content.len(), 100);
        let pieces = vec![sha1(&content[0..64]), sha1(&content[64..100])];

        Metainfo {
            info_hash: [0u8; 20],
            info: Info {
                name: "dir".to_string(),
                piece_length: 64,
                pieces,
                files: vec![
                    FileInfo {
                        path: PathBuf::from("a.bin"),
                        length: 60,
                        offset: 0,
                    },
                    FileInfo {
                        path: PathBuf::from("sub/b.bin"),
                        length: 40,
                        offset: 60,
                    },
                ],
                total_size: 100,
                is_single_file: false,
            },
            announce: None,
            announce_list: Vec::new(),
        }
    }

    fn content() -> Vec<u8> {
        (0u8..100).collect()
    }

    #[tokio::test]
    async fn test_write_then_read_spanning_files() {
        let content = content();
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(
            Arc::new(multi_file_metainfo(&content)),
            dir.path().to_path_buf(),
        );

        // Piece 0 spans both files (60 + 4 bytes)
        storage.write_piece(0, &content[0..64]).await.unwrap();
        storage.write_piece(1, &content[64..100]).await.unwrap();

        let block = storage.read_block(0, 50, 14).await.unwrap();
        assert_eq!(block, &content[50..64]);

        let block = storage.read_block(1, 0, 36).await.unwrap();
        assert_eq!(block, &content[64..100]);
    }

    #[tokio::test]
    async fn test_read_block_rejects_out_of_bounds() {
        let content = content();
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(
            Arc::new(multi_file_metainfo(&content)),
            dir.path().to_path_buf(),
        );

        assert!(storage.read_block(1, 30, 16).await.is_err());
        assert!(storage.read_block(9, 0, 1).await.is_err());
    }

    #[tokio::test]
    async fn test_current_state_detects_valid_pieces() {
        let content = content();
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(
            Arc::new(multi_file_metainfo(&content)),
            dir.path().to_path_buf(),
        );

        // Nothing on disk yet
        let state = storage.current_state().await.unwrap();
        assert_eq!(state.have.count_ones(), 0);
        assert_eq!(state.bytes_left, 100);
        assert!(!state.completed);

        // Only the second piece written
        storage.write_piece(1, &content[64..100]).await.unwrap();
        let state = storage.current_state().await.unwrap();
        assert!(!state.have[0]);
        assert!(state.have[1]);
        assert_eq!(state.bytes_left, 64);

        // Both pieces written
        storage.write_piece(0, &content[0..64]).await.unwrap();
        let state = storage.current_state().await.unwrap();
        assert!(state.completed);
        assert_eq!(state.bytes_left, 0);
    }

    #[tokio::test]
    async fn test_corrupted_piece_not_reported() {
        let content = content();
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(
            Arc::new(multi_file_metainfo(&content)),
            dir.path().to_path_buf(),
        );

        let mut corrupted = content[0..64].to_vec();
        corrupted[10] ^= 0xFF;
        storage.write_piece(0, &corrupted).await.unwrap();

        let state = storage.current_state().await.unwrap();
        assert!(!state.have[0]);
    }

    #[test]
    fn test_path_traversal_rejected() {
        let mut metainfo = multi_file_metainfo(&content());
        metainfo.info.files[0].path = PathBuf::from("../escape.bin");

        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(Arc::new(metainfo), dir.path().to_path_buf());

        assert!(storage.file_path(0).is_err());
    }
}

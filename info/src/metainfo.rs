use serde_derive::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum MetaInfoError {

    #[error("bencode error whilst decoding metainfo: {0}")]
    BencodeError(#[from] serde_bencode::Error),

    #[error("invalid file extension, expected .torrent")]
    InvalidExtension,

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error("invalid pieces length, must be divisible by 20")]
    InvalidPiecesLength,

    #[error("metainfo has neither a length nor a file list")]
    NoFiles,

    #[error("file(s) with no path")]
    FileEmptyPath,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct File {

    // Path components below the torrent root, last element is the file name.
    pub path: Vec<String>,

    // File length in bytes.
    pub length: u64,

    // Optional md5 of the file contents, rarely seen in the wild.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub md5sum: Option<String>,

}

#[derive(Clone, Deserialize, Serialize)]
pub struct Info {

    // Torrent name. Doubles as the file name for single file torrents and
    // the top directory name for multi file ones.
    pub name: String,

    // Every 20-byte SHA1 piece hash run together into a single blob.
    #[serde(with = "serde_bytes")]
    pub pieces: Vec<u8>,

    #[serde(rename = "piece length")]
    pub piece_length: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub md5sum: Option<String>,

    // Exactly one of length and files is present: length for a single file
    // torrent, files for a multi file one in download order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<File>>,

    // "1" restricts peer discovery to the trackers named here, no PEX or dht.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private: Option<u8>,

    #[serde(default, rename = "root hash", skip_serializing_if = "Option::is_none")]
    pub root_hash: Option<String>,

}

impl Info {
    // The infohash commits to the canonical bencoding of this dict, so the
    // optional fields above must drop out of serialization when absent.
    fn info_hash(&self) -> Result<[u8; 20], MetaInfoError> {
        use sha1::Digest;
        let mut hasher = sha1::Sha1::new();
        hasher.update(serde_bencode::to_bytes(&self)?);
        Ok(hasher.finalize().into())
    }
}

#[derive(Deserialize, Clone)]
pub struct MetaInfo {

    // Primary tracker url.
    #[serde(deserialize_with = "crate::de::url_deserialize")]
    pub announce: url::Url,

    pub info: Info,

    // Computed after decoding, not a key in the file.
    #[serde(skip)]
    pub info_hash: [u8; 20],

    // Character encoding of the string fields, when not utf-8.
    #[serde(default)]
    pub encoding: Option<String>,

    // Tracker tiers from the announce-list extension, taking precedence over
    // announce when present.
    #[serde(default)]
    #[serde(rename = "announce-list")]
    #[serde(deserialize_with = "crate::de::announce_list_deserialize")]
    pub announce_list: Option<Vec<Vec<url::Url>>>,

    // Unix timestamp of when the torrent was made.
    #[serde(default)]
    #[serde(rename = "creation date")]
    pub creation_date: Option<i64>,

    // Free-form note from the author.
    #[serde(default)]
    pub comment: Option<String>,

    // Tool that produced the .torrent file.
    #[serde(default)]
    #[serde(rename = "created by")]
    pub created_by: Option<String>,

}

impl MetaInfo {

    pub fn new<P: AsRef<std::path::Path>>(path: P) -> Result<MetaInfo, MetaInfoError> {

        if path.as_ref().extension().unwrap_or_default() != "torrent" {
            return Err(MetaInfoError::InvalidExtension);
        }
        Self::from_bytes(&std::fs::read(path)?)
    }

    pub fn from_bytes(buf: &[u8]) -> Result<MetaInfo, MetaInfoError> {

        let mut metainfo: MetaInfo = serde_bencode::from_bytes(buf)?;

        if metainfo.info.pieces.len() % 20 != 0 || metainfo.info.pieces.is_empty() {
            return Err(MetaInfoError::InvalidPiecesLength);
        }
        match &metainfo.info.files {
            Some(files) => {
                if files.iter().any(|f| f.path.is_empty()) {
                    return Err(MetaInfoError::FileEmptyPath);
                }
            }
            None => {
                if metainfo.info.length.is_none() {
                    return Err(MetaInfoError::NoFiles);
                }
            }
        }

        metainfo.info_hash = metainfo.info.info_hash()?;
        tracing::debug!("metainfo created: {:#?}", metainfo);
        Ok(metainfo)
    }

    // Canonical bencoding of the info dict, the payload of BEP-9 metadata
    // exchange and the preimage of the infohash.
    pub fn raw_info(&self) -> Result<Vec<u8>, MetaInfoError> {
        Ok(serde_bencode::to_bytes(&self.info)?)
    }

    pub fn piece_hashes(&self) -> Vec<[u8; 20]> {
        self.info.pieces
            .chunks_exact(20)
            // from_bytes rejected any blob that is not a multiple of 20.
            .map(|c| c.try_into().unwrap())
            .collect()
    }

    pub fn piece_len(&self) -> u64 { self.info.piece_length as u64 }

    pub fn num_pieces(&self) -> usize { self.info.pieces.len() / 20 }

    pub fn is_multi_file(&self) -> bool { self.info.files.is_some() }

    pub fn total_len(&self) -> u64 {
        if let Some(files) = &self.info.files {
            files.iter().map(|f| f.length).sum()
        } else {
            self.info.length.unwrap_or(0)
        }
    }

    pub fn info_hash(&self) -> [u8; 20] { self.info_hash }

    pub fn name(&self) -> &str { &self.info.name }

    // Flat (relative path, length) list in declared order. Single file
    // torrents yield one entry named after the torrent.
    pub fn files(&self) -> Vec<(String, u64)> {
        if let Some(files) = &self.info.files {
            files.iter().map(|f| (f.path.join("/"), f.length)).collect()
        } else {
            // Validated in from_bytes.
            vec![(self.info.name.clone(), self.info.length.unwrap())]
        }
    }

    // Formatting methods.

    pub fn creation_date_fmt(&self) -> Option<String> {
        self.creation_date.map(|v| {
            let date = chrono::NaiveDateTime::from_timestamp_opt(v, 0);
            date.map(|v| v.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "Invalid date".to_string())
        })
    }

    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }

    pub fn size_fmt(&self) -> String {
        format_size(self.total_len())
    }
}

fn format_size(bytes: u64) -> String {
    let mut size = bytes as f64;
    for unit in ["B", "KiB", "MiB", "GiB"] {
        if size <= 1024.0 {
            return format!("{:.2} {}", size, unit);
        }
        size /= 1024.0;
    }
    format!("{:.2} TiB", size)
}

/* Both Debug impls are written by hand: the pieces blob runs to tens of
kilobytes of raw hashes, so Info prints its count instead, and MetaInfo
renders urls, hash and date in readable form. */

impl std::fmt::Debug for MetaInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let announce_list = self.announce_list.as_ref().map(|tiers| {
            tiers.iter()
                .map(|tier| tier.iter().map(|url| url.as_str()).collect())
                .collect::<Vec<Vec<&str>>>()
        });
        f.debug_struct("MetaInfo")
            .field("announce", &self.announce.as_str())
            .field("announce_list", &announce_list)
            .field("info", &self.info)
            .field("info_hash", &self.info_hash_hex())
            .field("encoding", &self.encoding)
            .field("creation_date", &self.creation_date_fmt())
            .field("comment", &self.comment)
            .field("created_by", &self.created_by)
            .finish()
    }
}

impl std::fmt::Debug for Info {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Info")
            .field("name", &self.name)
            .field("piece_length", &self.piece_length)
            .field("num_pieces", &(self.pieces.len() / 20))
            .field("length", &self.length)
            .field("files", &self.files)
            .field("md5sum", &self.md5sum)
            .field("private", &self.private)
            .field("root_hash", &self.root_hash)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Wraps a bencoded info dict in a minimal metainfo dict.
    fn metainfo_bytes(info: &Info) -> Vec<u8> {
        let info_bytes = serde_bencode::to_bytes(info).unwrap();
        let announce = "http://tracker.example/announce";
        let mut buf = Vec::new();
        buf.extend_from_slice(b"d8:announce");
        buf.extend_from_slice(format!("{}:{}", announce.len(), announce).as_bytes());
        buf.extend_from_slice(b"4:info");
        buf.extend_from_slice(&info_bytes);
        buf.push(b'e');
        buf
    }

    fn multi_file_info() -> Info {
        Info {
            name: "archive".to_string(),
            pieces: vec![0xab; 20 * 4],
            piece_length: 2,
            md5sum: None,
            length: None,
            files: Some(vec![
                File { path: vec!["test".into(), "t1.txt".into()], length: 3, md5sum: None },
                File { path: vec!["t2.txt".into()], length: 2, md5sum: None },
                File { path: vec!["dir1".into(), "dir".into(), "x.x".into()], length: 1, md5sum: None },
                File { path: vec!["dir1".into(), "dir".into(), "x.y".into()], length: 2, md5sum: None },
            ]),
            private: None,
            root_hash: None,
        }
    }

    #[test]
    fn test_multi_file_metainfo() {
        let info = multi_file_info();
        let metainfo = MetaInfo::from_bytes(&metainfo_bytes(&info)).unwrap();

        assert_eq!(metainfo.num_pieces(), 4);
        assert_eq!(metainfo.piece_len(), 2);
        assert_eq!(metainfo.total_len(), 8);
        assert!(metainfo.is_multi_file());
        assert_eq!(metainfo.name(), "archive");
        assert_eq!(metainfo.files(), vec![
            ("test/t1.txt".to_string(), 3),
            ("t2.txt".to_string(), 2),
            ("dir1/dir/x.x".to_string(), 1),
            ("dir1/dir/x.y".to_string(), 2),
        ]);
        assert_eq!(metainfo.piece_hashes().len(), 4);
    }

    #[test]
    fn test_single_file_metainfo() {
        let info = Info {
            name: "a.bin".to_string(),
            pieces: vec![0x11; 20 * 3],
            piece_length: 4,
            md5sum: None,
            length: Some(10),
            files: None,
            private: None,
            root_hash: None,
        };
        let metainfo = MetaInfo::from_bytes(&metainfo_bytes(&info)).unwrap();

        assert!(!metainfo.is_multi_file());
        assert_eq!(metainfo.total_len(), 10);
        assert_eq!(metainfo.files(), vec![("a.bin".to_string(), 10)]);
    }

    #[test]
    fn test_raw_info_is_canonical() {
        // The re-encoded info dict matches the bytes inside the metainfo, so
        // slicing raw_info for metadata exchange reproduces the infohash
        // preimage.
        let info = multi_file_info();
        let info_bytes = serde_bencode::to_bytes(&info).unwrap();
        let metainfo = MetaInfo::from_bytes(&metainfo_bytes(&info)).unwrap();
        assert_eq!(metainfo.raw_info().unwrap(), info_bytes);
    }

    #[test]
    fn test_info_hash_deterministic() {
        let bytes = metainfo_bytes(&multi_file_info());
        let a = MetaInfo::from_bytes(&bytes).unwrap();
        let b = MetaInfo::from_bytes(&bytes).unwrap();
        assert_eq!(a.info_hash(), b.info_hash());
        assert_ne!(a.info_hash(), [0; 20]);
        assert_eq!(a.info_hash_hex().len(), 40);
    }

    #[test]
    fn test_torrent_info_from_metainfo() {
        let metainfo = MetaInfo::from_bytes(&metainfo_bytes(&multi_file_info())).unwrap();
        let info = crate::service::TorrentInfo::new(&metainfo).unwrap();

        assert_eq!(info.num_pieces(), 4);
        assert_eq!(info.total_len(), 8);
        assert_eq!(info.piece_size(), 2);

        // The metadata table holds exactly the infohash preimage.
        let raw = metainfo.raw_info().unwrap();
        assert_eq!(info.metadata_size(), raw.len());
        assert_eq!(info.metadata_block(0).unwrap(), raw);
    }

    #[test]
    fn test_invalid_pieces_length() {
        let mut info = multi_file_info();
        info.pieces = vec![0xab; 19];
        let err = MetaInfo::from_bytes(&metainfo_bytes(&info)).unwrap_err();
        assert!(matches!(err, MetaInfoError::InvalidPiecesLength));
    }

    #[test]
    fn test_missing_length_and_files() {
        let mut info = multi_file_info();
        info.files = None;
        let err = MetaInfo::from_bytes(&metainfo_bytes(&info)).unwrap_err();
        assert!(matches!(err, MetaInfoError::NoFiles));
    }

    #[test]
    fn test_invalid_extension() {
        let err = MetaInfo::new("some/file.txt").unwrap_err();
        assert!(matches!(err, MetaInfoError::InvalidExtension));
    }
}

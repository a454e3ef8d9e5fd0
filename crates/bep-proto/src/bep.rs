//! Block Exchange Protocol v1 protobuf messages.
//!
//! Field numbers follow the Syncthing `bep.proto` schema.

/// Hello exchanged before TLS application data.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Hello {
    /// Human readable device name
    #[prost(string, tag = "1")]
    pub device_name: String,
    /// Client implementation name
    #[prost(string, tag = "2")]
    pub client_name: String,
    /// Client implementation version
    #[prost(string, tag = "3")]
    pub client_version: String,
}

/// Frame header.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Header {
    /// Payload message type
    #[prost(enumeration = "MessageType", tag = "1")]
    pub r#type: i32,
    /// Payload compression
    #[prost(enumeration = "MessageCompression", tag = "2")]
    pub compression: i32,
}

/// Payload message type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum MessageType {
    /// ClusterConfig
    ClusterConfig = 0,
    /// Index
    Index = 1,
    /// IndexUpdate
    IndexUpdate = 2,
    /// Request
    Request = 3,
    /// Response
    Response = 4,
    /// DownloadProgress
    DownloadProgress = 5,
    /// Ping
    Ping = 6,
    /// Close
    Close = 7,
}

/// Payload compression.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum MessageCompression {
    /// Uncompressed
    None = 0,
    /// LZ4 block with a 4-byte uncompressed length prefix
    Lz4 = 1,
}

/// Folder sharing announcement.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClusterConfig {
    /// Announced folders
    #[prost(message, repeated, tag = "1")]
    pub folders: Vec<Folder>,
}

/// One folder of a cluster config.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Folder {
    /// Folder id
    #[prost(string, tag = "1")]
    pub id: String,
    /// Display label
    #[prost(string, tag = "2")]
    pub label: String,
    /// Folder is receive-only on the sender
    #[prost(bool, tag = "3")]
    pub read_only: bool,
    /// Permissions are ignored
    #[prost(bool, tag = "4")]
    pub ignore_permissions: bool,
    /// Deletes are ignored
    #[prost(bool, tag = "5")]
    pub ignore_delete: bool,
    /// Temporary indexes are disabled
    #[prost(bool, tag = "6")]
    pub disable_temp_indexes: bool,
    /// Folder is paused
    #[prost(bool, tag = "7")]
    pub paused: bool,
    /// Devices sharing the folder
    #[prost(message, repeated, tag = "16")]
    pub devices: Vec<Device>,
}

/// Device entry of a folder announcement.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Device {
    /// Raw 32-byte device id
    #[prost(bytes = "vec", tag = "1")]
    pub id: Vec<u8>,
    /// Device name
    #[prost(string, tag = "2")]
    pub name: String,
    /// Known addresses
    #[prost(string, repeated, tag = "3")]
    pub addresses: Vec<String>,
    /// Compression preference
    #[prost(enumeration = "Compression", tag = "4")]
    pub compression: i32,
    /// Expected certificate name
    #[prost(string, tag = "5")]
    pub cert_name: String,
    /// Highest sequence of the device's index
    #[prost(int64, tag = "6")]
    pub max_sequence: i64,
    /// Device is an introducer
    #[prost(bool, tag = "7")]
    pub introducer: bool,
    /// Index id of the device's index
    #[prost(uint64, tag = "8")]
    pub index_id: u64,
    /// Skip removals from the introducer
    #[prost(bool, tag = "9")]
    pub skip_introduction_removals: bool,
}

/// Per-device compression preference.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum Compression {
    /// Compress metadata only
    Metadata = 0,
    /// Never compress
    Never = 1,
    /// Compress everything
    Always = 2,
}

/// Full index of a folder.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Index {
    /// Folder id
    #[prost(string, tag = "1")]
    pub folder: String,
    /// Records
    #[prost(message, repeated, tag = "2")]
    pub files: Vec<FileInfo>,
}

/// Incremental index update.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct IndexUpdate {
    /// Folder id
    #[prost(string, tag = "1")]
    pub folder: String,
    /// Records
    #[prost(message, repeated, tag = "2")]
    pub files: Vec<FileInfo>,
}

/// Wire file record.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FileInfo {
    /// Folder-relative path
    #[prost(string, tag = "1")]
    pub name: String,
    /// Entry type
    #[prost(enumeration = "FileInfoType", tag = "2")]
    pub r#type: i32,
    /// Size in bytes
    #[prost(int64, tag = "3")]
    pub size: i64,
    /// Unix permission bits
    #[prost(uint32, tag = "4")]
    pub permissions: u32,
    /// Modification time, seconds part
    #[prost(int64, tag = "5")]
    pub modified_s: i64,
    /// Tombstone
    #[prost(bool, tag = "6")]
    pub deleted: bool,
    /// Record is invalid on the sender
    #[prost(bool, tag = "7")]
    pub invalid: bool,
    /// Permissions are not meaningful
    #[prost(bool, tag = "8")]
    pub no_permissions: bool,
    /// Version vector
    #[prost(message, optional, tag = "9")]
    pub version: Option<Vector>,
    /// Sender's sequence number for this record
    #[prost(int64, tag = "10")]
    pub sequence: i64,
    /// Modification time, nanoseconds part
    #[prost(int32, tag = "11")]
    pub modified_ns: i32,
    /// Short id of the last modifier
    #[prost(uint64, tag = "12")]
    pub modified_by: u64,
    /// Block size used for `blocks`
    #[prost(int32, tag = "13")]
    pub block_size: i32,
    /// Content blocks
    #[prost(message, repeated, tag = "16")]
    pub blocks: Vec<BlockInfo>,
    /// Symlink target
    #[prost(string, tag = "17")]
    pub symlink_target: String,
}

/// Wire entry type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum FileInfoType {
    /// Regular file
    File = 0,
    /// Directory
    Directory = 1,
    /// Symlink to a file (deprecated)
    SymlinkFile = 2,
    /// Symlink to a directory (deprecated)
    SymlinkDirectory = 3,
    /// Symlink
    Symlink = 4,
}

/// Wire block record.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BlockInfo {
    /// Offset within the file
    #[prost(int64, tag = "1")]
    pub offset: i64,
    /// Block size
    #[prost(int32, tag = "2")]
    pub size: i32,
    /// SHA-256 of the block
    #[prost(bytes = "vec", tag = "3")]
    pub hash: Vec<u8>,
    /// Rolling weak hash
    #[prost(uint32, tag = "4")]
    pub weak_hash: u32,
}

/// Version vector.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Vector {
    /// Counters
    #[prost(message, repeated, tag = "1")]
    pub counters: Vec<Counter>,
}

/// Version vector counter.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Counter {
    /// Device short id
    #[prost(uint64, tag = "1")]
    pub id: u64,
    /// Counter value
    #[prost(uint64, tag = "2")]
    pub value: u64,
}

/// Block request.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Request {
    /// Correlation id
    #[prost(int32, tag = "1")]
    pub id: i32,
    /// Folder id
    #[prost(string, tag = "2")]
    pub folder: String,
    /// Folder-relative path
    #[prost(string, tag = "3")]
    pub name: String,
    /// Byte offset
    #[prost(int64, tag = "4")]
    pub offset: i64,
    /// Byte count
    #[prost(int32, tag = "5")]
    pub size: i32,
    /// Expected block hash
    #[prost(bytes = "vec", tag = "6")]
    pub hash: Vec<u8>,
    /// Read from a temporary file
    #[prost(bool, tag = "7")]
    pub from_temporary: bool,
}

/// Block response.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Response {
    /// Correlation id of the request
    #[prost(int32, tag = "1")]
    pub id: i32,
    /// Block data
    #[prost(bytes = "vec", tag = "2")]
    pub data: Vec<u8>,
    /// Result code
    #[prost(enumeration = "ErrorCode", tag = "3")]
    pub code: i32,
}

/// Response result code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ErrorCode {
    /// Success
    NoError = 0,
    /// Unspecified failure
    Generic = 1,
    /// File does not exist
    NoSuchFile = 2,
    /// File cannot be served
    InvalidFile = 3,
}

/// Download progress of temporary files.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DownloadProgress {
    /// Folder id
    #[prost(string, tag = "1")]
    pub folder: String,
    /// Per-file updates
    #[prost(message, repeated, tag = "2")]
    pub updates: Vec<FileDownloadProgressUpdate>,
}

/// Progress of one file download.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FileDownloadProgressUpdate {
    /// Update kind
    #[prost(enumeration = "FileDownloadProgressUpdateType", tag = "1")]
    pub update_type: i32,
    /// Folder-relative path
    #[prost(string, tag = "2")]
    pub name: String,
    /// Version being downloaded
    #[prost(message, optional, tag = "3")]
    pub version: Option<Vector>,
    /// Indexes of blocks already available
    #[prost(int32, repeated, tag = "4")]
    pub block_indexes: Vec<i32>,
}

/// Download progress update kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum FileDownloadProgressUpdateType {
    /// Blocks were added
    Append = 0,
    /// File is no longer downloaded
    Forget = 1,
}

/// Keep-alive.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Ping {}

/// Orderly connection close.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Close {
    /// Close reason
    #[prost(string, tag = "1")]
    pub reason: String,
}

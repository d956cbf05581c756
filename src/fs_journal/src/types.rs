use std::fmt;

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::{JournalError, JournalResult};

const TLF_ID_LEN: usize = 32;
const VERIFYING_KEY_PREFIX: &str = "0120";
const VERIFYING_KEY_LEN: usize = 68;

const TLF_SUFFIX_PRIVATE: &str = "16";
const TLF_SUFFIX_PUBLIC: &str = "17";
const TLF_SUFFIX_SINGLE_TEAM: &str = "26";
const USER_SUFFIX: &str = "19";
const TEAM_SUFFIX_ROOT: &str = "24";
const TEAM_SUFFIX_SUB: &str = "25";

fn is_lower_hex(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn random_hex(len_bytes: usize) -> String {
    let mut buf = vec![0u8; len_bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    to_hex(&buf)
}

macro_rules! string_id_serde {
    ($name:ident) => {
        impl TryFrom<String> for $name {
            type Error = JournalError;
            fn try_from(value: String) -> JournalResult<Self> {
                $name::new(&value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> String {
                value.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }
    };
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TlfType {
    Private,
    Public,
    SingleTeam,
}

impl TlfType {
    fn suffix(self) -> &'static str {
        match self {
            TlfType::Private => TLF_SUFFIX_PRIVATE,
            TlfType::Public => TLF_SUFFIX_PUBLIC,
            TlfType::SingleTeam => TLF_SUFFIX_SINGLE_TEAM,
        }
    }
}

/// Folder id: 16 bytes of hex, the last byte encodes the folder type.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TlfId(String);

string_id_serde!(TlfId);

impl TlfId {
    pub fn new(s: &str) -> JournalResult<Self> {
        if s.len() != TLF_ID_LEN || !is_lower_hex(s) {
            return Err(JournalError::InvalidParam(format!("bad tlf id: {:?}", s)));
        }
        let id = TlfId(s.to_string());
        id.parse_type()?;
        Ok(id)
    }

    pub fn random(tlf_type: TlfType) -> Self {
        let body = random_hex(TLF_ID_LEN / 2 - 1);
        TlfId(format!("{}{}", body, tlf_type.suffix()))
    }

    fn parse_type(&self) -> JournalResult<TlfType> {
        match &self.0[TLF_ID_LEN - 2..] {
            TLF_SUFFIX_PRIVATE => Ok(TlfType::Private),
            TLF_SUFFIX_PUBLIC => Ok(TlfType::Public),
            TLF_SUFFIX_SINGLE_TEAM => Ok(TlfType::SingleTeam),
            other => Err(JournalError::InvalidParam(format!(
                "unknown tlf type suffix {} in {}",
                other, self.0
            ))),
        }
    }

    pub fn tlf_type(&self) -> TlfType {
        // Validated on construction.
        self.parse_type().unwrap_or(TlfType::Private)
    }
}

/// A device's public verifying key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VerifyingKey(String);

string_id_serde!(VerifyingKey);

impl VerifyingKey {
    pub fn new(s: &str) -> JournalResult<Self> {
        if s.len() != VERIFYING_KEY_LEN || !s.starts_with(VERIFYING_KEY_PREFIX) || !is_lower_hex(s)
        {
            return Err(JournalError::InvalidParam(format!(
                "bad verifying key: {:?}",
                s
            )));
        }
        Ok(VerifyingKey(s.to_string()))
    }

    pub fn random() -> Self {
        VerifyingKey(format!("{}{}", VERIFYING_KEY_PREFIX, random_hex(32)))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UserId(String);

string_id_serde!(UserId);

impl UserId {
    pub fn new(s: &str) -> JournalResult<Self> {
        if s.len() != 32 || !is_lower_hex(s) || !s.ends_with(USER_SUFFIX) {
            return Err(JournalError::InvalidParam(format!("bad user id: {:?}", s)));
        }
        Ok(UserId(s.to_string()))
    }

    pub fn random() -> Self {
        UserId(format!("{}{}", random_hex(15), USER_SUFFIX))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TeamId(String);

string_id_serde!(TeamId);

impl TeamId {
    pub fn new(s: &str) -> JournalResult<Self> {
        if s.len() != 32
            || !is_lower_hex(s)
            || !(s.ends_with(TEAM_SUFFIX_ROOT) || s.ends_with(TEAM_SUFFIX_SUB))
        {
            return Err(JournalError::InvalidParam(format!("bad team id: {:?}", s)));
        }
        Ok(TeamId(s.to_string()))
    }

    pub fn random(sub_team: bool) -> Self {
        let suffix = if sub_team {
            TEAM_SUFFIX_SUB
        } else {
            TEAM_SUFFIX_ROOT
        };
        TeamId(format!("{}{}", random_hex(15), suffix))
    }

    pub fn is_sub_team(&self) -> bool {
        self.0.ends_with(TEAM_SUFFIX_SUB)
    }
}

/// Billing owner of a folder's storage.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserOrTeamId {
    User(UserId),
    Team(TeamId),
}

impl fmt::Display for UserOrTeamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UserOrTeamId::User(uid) => write!(f, "{}", uid),
            UserOrTeamId::Team(tid) => write!(f, "{}", tid),
        }
    }
}

/// Metadata branch. `BranchId::NULL` is the merged (master) branch; any
/// other value is a local conflict branch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BranchId([u8; 16]);

impl BranchId {
    pub const NULL: BranchId = BranchId([0u8; 16]);

    pub fn random() -> Self {
        let mut buf = [0u8; 16];
        loop {
            rand::thread_rng().fill_bytes(&mut buf);
            if buf != [0u8; 16] {
                return BranchId(buf);
            }
        }
    }

    pub fn is_null(&self) -> bool {
        *self == BranchId::NULL
    }
}

impl fmt::Display for BranchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&to_hex(&self.0))
    }
}

impl TryFrom<String> for BranchId {
    type Error = JournalError;
    fn try_from(value: String) -> JournalResult<Self> {
        if value.len() != 32 || !is_lower_hex(&value) {
            return Err(JournalError::DecodeError(format!(
                "bad branch id: {:?}",
                value
            )));
        }
        let mut buf = [0u8; 16];
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&value[i * 2..i * 2 + 2], 16)
                .map_err(|e| JournalError::DecodeError(format!("bad branch id: {}", e)))?;
        }
        Ok(BranchId(buf))
    }
}

impl From<BranchId> for String {
    fn from(value: BranchId) -> String {
        to_hex(&value.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BlockId(String);

string_id_serde!(BlockId);

impl BlockId {
    pub fn new(s: &str) -> JournalResult<Self> {
        if !is_lower_hex(s) {
            return Err(JournalError::InvalidParam(format!("bad block id: {:?}", s)));
        }
        Ok(BlockId(s.to_string()))
    }

    pub fn random() -> Self {
        BlockId(random_hex(32))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Revision(pub u64);

impl Revision {
    pub const INITIAL: Revision = Revision(1);

    pub fn next(self) -> Revision {
        Revision(self.0 + 1)
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Resolved membership of a folder, as known to the caller.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlfHandle {
    pub name: String,
    pub tlf_type: TlfType,
    pub resolved_writers: Vec<UserOrTeamId>,
    pub resolved_readers: Vec<UserOrTeamId>,
}

impl TlfHandle {
    pub fn first_resolved_writer(&self) -> Option<&UserOrTeamId> {
        self.resolved_writers.first()
    }
}

/// An already-encrypted metadata revision; `data` is opaque here.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootMetadata {
    pub tlf_id: TlfId,
    pub revision: Revision,
    pub branch_id: BranchId,
    pub writer: UserId,
    pub writer_key: VerifyingKey,
    pub data: Vec<u8>,
}

/// Requested behaviour of a journal's background flusher.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackgroundWorkStatus {
    Paused,
    Enabled,
    /// Flush only after `finish_single_op` is called.
    SingleOpEnabled,
}

impl fmt::Display for BackgroundWorkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BackgroundWorkStatus::Paused => "paused",
            BackgroundWorkStatus::Enabled => "enabled",
            BackgroundWorkStatus::SingleOpEnabled => "single-op",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockCacheLifetime {
    Transient,
    Permanent,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaInfo {
    pub used_bytes: u64,
    pub limit_bytes: u64,
}

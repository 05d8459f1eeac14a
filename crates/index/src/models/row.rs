use super::{Lifecycle, NO_SIZE, Version};
use crate::Timestamp;
use crate::error::{Error, ErrorKind};
use exn::{OptionExt, ResultExt};
use serde_json::{Map, Value, from_str as from_json, to_string as to_json};
use tempo_storage::Hashes;

/// Content and delete rows.
const NOT_REF: i64 = 0;
/// Resolved and broken references.
const RESOLVED_REF: i64 = 1;
const PENDING_REF: i64 = 2;

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub(crate) struct VersionRow {
    pub(crate) stored_name: String,
    pub(crate) apath: String,
    pub(crate) timestamp: i64,
    pub(crate) size: i64,
    pub(crate) mtime: Option<f64>,
    pub(crate) checksum: Option<String>,
    pub(crate) is_ref: i64,
    pub(crate) ref_target: Option<String>,
    pub(crate) from_destination: bool,
    pub(crate) extra: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct HistoryRow {
    #[sqlx(flatten)]
    pub(crate) version: VersionRow,
    pub(crate) ref_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct SnapshotRow {
    #[sqlx(flatten)]
    pub(crate) version: VersionRow,
    /// False only for a resolved reference whose target row is gone.
    pub(crate) referent_present: bool,
}

fn checksum_column(checksum: &Hashes) -> Result<Option<String>, Error> {
    if checksum.is_empty() {
        return Ok(None);
    }
    Ok(Some(to_json(checksum).or_raise(|| ErrorKind::InvalidData("checksum"))?))
}

fn size_column(size: u64) -> Result<i64, Error> {
    Ok(i64::try_from(size).or_raise(|| ErrorKind::InvalidData("size"))?)
}

impl TryFrom<&Version> for VersionRow {
    type Error = Error;
    fn try_from(version: &Version) -> Result<Self, Self::Error> {
        let (size, mtime, checksum, is_ref, ref_target) = match &version.lifecycle {
            Lifecycle::Content { size, mtime, checksum } => {
                (size_column(*size)?, *mtime, checksum_column(checksum)?, NOT_REF, None)
            },
            Lifecycle::Delete => (NO_SIZE, None, None, NOT_REF, None),
            Lifecycle::ReferencePending => (NO_SIZE, None, None, PENDING_REF, None),
            Lifecycle::ReferenceResolved { target, size, mtime, checksum } => {
                (size_column(*size)?, *mtime, checksum_column(checksum)?, RESOLVED_REF, Some(target.clone()))
            },
            Lifecycle::ReferenceBroken { target } => (NO_SIZE, None, None, RESOLVED_REF, target.clone()),
        };
        let extra = if version.extra.is_empty() {
            None
        } else {
            Some(to_json(&version.extra).or_raise(|| ErrorKind::InvalidData("extra attributes"))?)
        };
        Ok(Self {
            stored_name: version.stored_name.clone(),
            apath: version.apath.clone(),
            timestamp: version.timestamp.as_unix(),
            size,
            mtime,
            checksum,
            is_ref,
            ref_target,
            from_destination: version.from_destination,
            extra,
        })
    }
}

impl TryFrom<VersionRow> for Version {
    type Error = Error;
    fn try_from(row: VersionRow) -> Result<Self, Self::Error> {
        let checksum = row
            .checksum
            .as_deref()
            .map(from_json::<Hashes>)
            .transpose()
            .or_raise(|| ErrorKind::InvalidData("checksum"))?
            .unwrap_or_default();
        let lifecycle = match (row.is_ref, u64::try_from(row.size).ok()) {
            (NOT_REF, Some(size)) => Lifecycle::Content { size, mtime: row.mtime, checksum },
            (NOT_REF, None) => Lifecycle::Delete,
            (PENDING_REF, _) => Lifecycle::ReferencePending,
            (RESOLVED_REF, Some(size)) => Lifecycle::ReferenceResolved {
                target: row.ref_target.ok_or_raise(|| ErrorKind::InvalidData("reference target"))?,
                size,
                mtime: row.mtime,
                checksum,
            },
            (RESOLVED_REF, None) => Lifecycle::ReferenceBroken { target: row.ref_target },
            _ => exn::bail!(ErrorKind::InvalidData("is_ref")),
        };
        let extra = row
            .extra
            .as_deref()
            .map(from_json::<Map<String, Value>>)
            .transpose()
            .or_raise(|| ErrorKind::InvalidData("extra attributes"))?
            .unwrap_or_default();
        Ok(Self {
            stored_name: row.stored_name,
            apath: row.apath,
            timestamp: Timestamp::from_unix(row.timestamp),
            lifecycle,
            from_destination: row.from_destination,
            extra,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(is_ref: i64, size: i64, ref_target: Option<&str>) -> VersionRow {
        VersionRow {
            stored_name: "docs/a.19700101000001.txt".to_string(),
            apath: "docs/a.txt".to_string(),
            timestamp: 1,
            size,
            mtime: Some(0.5),
            checksum: Some(r#"{"md5":"d41d8cd98f00b204e9800998ecf8427e"}"#.to_string()),
            is_ref,
            ref_target: ref_target.map(str::to_string),
            from_destination: true,
            extra: Some(r#"{"Tier":"COLD"}"#.to_string()),
        }
    }

    #[test]
    fn test_row_to_model() {
        let version = Version::try_from(row(0, 4, None)).unwrap();
        let Lifecycle::Content { size, mtime, checksum } = &version.lifecycle else {
            panic!("expected content, got {:?}", version.lifecycle);
        };
        assert_eq!(*size, 4);
        assert_eq!(*mtime, Some(0.5));
        assert_eq!(checksum.get("md5").map(String::as_str), Some("d41d8cd98f00b204e9800998ecf8427e"));
        assert_eq!(version.extra.get("Tier"), Some(&Value::from("COLD")));
        assert_eq!(version.timestamp, Timestamp::from_unix(1));
        assert!(version.from_destination);
    }

    #[test]
    fn test_lifecycle_decoding() {
        assert_eq!(Version::try_from(row(0, -1, None)).unwrap().lifecycle, Lifecycle::Delete);
        assert_eq!(Version::try_from(row(2, -1, None)).unwrap().lifecycle, Lifecycle::ReferencePending);
        assert_eq!(
            Version::try_from(row(1, -1, Some("b.19700101000001.txt"))).unwrap().lifecycle,
            Lifecycle::ReferenceBroken { target: Some("b.19700101000001.txt".to_string()) },
        );
        let resolved = Version::try_from(row(1, 4, Some("b.19700101000001.txt"))).unwrap();
        assert_eq!(resolved.lifecycle.target(), Some("b.19700101000001.txt"));
        assert_eq!(resolved.size(), 4);
    }

    #[test]
    fn test_invalid_rows() {
        let err = Version::try_from(row(7, 4, None)).unwrap_err();
        assert_eq!(&*err, &ErrorKind::InvalidData("is_ref"));
        let err = Version::try_from(row(1, 4, None)).unwrap_err();
        assert_eq!(&*err, &ErrorKind::InvalidData("reference target"));
        let mut bad = row(0, 4, None);
        bad.checksum = Some("not json".to_string());
        let err = Version::try_from(bad).unwrap_err();
        assert_eq!(&*err, &ErrorKind::InvalidData("checksum"));
    }

    #[test]
    fn test_model_to_row_and_back() {
        let original = Version::try_from(row(1, 4, Some("b.19700101000001.txt"))).unwrap();
        let encoded = VersionRow::try_from(&original).unwrap();
        assert_eq!(encoded.is_ref, RESOLVED_REF);
        assert_eq!(Version::try_from(encoded).unwrap(), original);

        let delete = Version::new("a.txt", Timestamp::from_unix(3), Lifecycle::Delete);
        let encoded = VersionRow::try_from(&delete).unwrap();
        assert_eq!((encoded.size, encoded.is_ref, encoded.checksum, encoded.extra), (NO_SIZE, NOT_REF, None, None));
    }
}

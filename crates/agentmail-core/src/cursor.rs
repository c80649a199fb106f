use time::OffsetDateTime;

use crate::error::MailError;
use crate::message::{id_time, is_valid_id, rfc3339, Message};

/// Resume point shared by backlog replay, relay and client reconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cursor {
    /// Strictly after this id.
    Id(String),
    /// At or after this instant.
    Time(OffsetDateTime),
}

impl Cursor {
    /// Builds a cursor from optional wire fields, preferring the id.
    pub fn from_parts(
        since_id: Option<&str>,
        since_time: Option<&str>,
    ) -> Result<Option<Self>, MailError> {
        if let Some(id) = since_id.map(str::trim).filter(|s| !s.is_empty()) {
            if !is_valid_id(id) {
                return Err(MailError::InvalidId { id: id.to_owned() });
            }
            return Ok(Some(Self::Id(id.to_owned())));
        }

        if let Some(raw) = since_time.map(str::trim).filter(|s| !s.is_empty()) {
            let t = rfc3339::parse(raw)
                .map_err(|err| MailError::Protocol(format!("invalid since_time {raw:?}: {err}")))?;
            return Ok(Some(Self::Time(t)));
        }

        Ok(None)
    }

    /// Cheap filter on the id alone. May admit ids that `admits` later rejects,
    /// never the other way round.
    pub fn may_admit(&self, id: &str) -> bool {
        match self {
            Self::Id(after) => id > after.as_str(),
            Self::Time(t) => match id_time(id) {
                Some(id_t) => id_t.unix_timestamp() >= t.unix_timestamp(),
                None => true,
            },
        }
    }

    pub fn admits(&self, msg: &Message) -> bool {
        match self {
            Self::Id(after) => msg.id.as_str() > after.as_str(),
            Self::Time(t) => msg.time >= *t,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Body;

    fn msg(id: &str, secs: i64) -> Message {
        Message {
            id: id.to_owned(),
            from: "alice".to_owned(),
            to: "task".to_owned(),
            time: OffsetDateTime::from_unix_timestamp(secs).unwrap(),
            body: Body::Text("x".to_owned()),
            reply_to: None,
            priority: None,
        }
    }

    #[test]
    fn id_cursor_is_exclusive() {
        let c = Cursor::Id("20260209-080000-0005".to_owned());
        assert!(!c.admits(&msg("20260209-080000-0005", 1_770_624_000)));
        assert!(c.admits(&msg("20260209-080000-0006", 1_770_624_000)));
        assert!(!c.may_admit("20260209-080000-0004"));
    }

    #[test]
    fn time_cursor_is_inclusive() {
        let t = OffsetDateTime::from_unix_timestamp(1_770_624_000).unwrap();
        let c = Cursor::Time(t);
        assert!(c.admits(&msg("20260209-080000-0001", 1_770_624_000)));
        assert!(!c.admits(&msg("20260209-075959-0001", 1_770_623_999)));
        assert!(!c.may_admit("20260209-075959-0001"));
        assert!(c.may_admit("20260209-080000-0001"));
    }

    #[test]
    fn from_parts_prefers_id_and_validates() {
        let c = Cursor::from_parts(Some("20260209-080000-0001"), Some("2026-02-09T08:00:00Z"))
            .unwrap();
        assert_eq!(c, Some(Cursor::Id("20260209-080000-0001".to_owned())));

        let c = Cursor::from_parts(None, Some("2026-02-09T08:00:00Z")).unwrap();
        assert!(matches!(c, Some(Cursor::Time(_))));

        assert!(Cursor::from_parts(None, None).unwrap().is_none());
        assert!(Cursor::from_parts(Some("../x"), None).is_err());
        assert!(Cursor::from_parts(None, Some("yesterday")).is_err());
    }
}

use crate::access::check_read;
use crate::cursor::Cursor;
use crate::error::MailError;
use crate::message::{validate_name, Mailbox, Message};
use crate::store::MessageStore;

/// Which mailboxes a watch or relay subscription covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetFilter {
    Topic(String),
    Dm(String),
    /// An agent's own DM mailbox plus every topic.
    Inbox(String),
    AllTopics,
    /// Every topic and every DM mailbox. Only relay peers get this.
    Everything,
}

impl TargetFilter {
    /// Resolves a client watch target. Empty or `*` means the agent's inbox,
    /// or all topics when no agent identity is given.
    pub fn for_watch(target: &str, agent: Option<&str>) -> Result<Self, MailError> {
        let target = target.trim();
        if target.is_empty() || target == "*" {
            return match agent.map(str::trim).filter(|a| !a.is_empty()) {
                Some(agent) => {
                    validate_name(agent).map_err(|reason| MailError::InvalidAddress {
                        address: agent.to_owned(),
                        reason,
                    })?;
                    Ok(Self::Inbox(agent.to_owned()))
                }
                None => Ok(Self::AllTopics),
            };
        }

        Ok(match Mailbox::parse(target)? {
            Mailbox::Topic(name) => Self::Topic(name),
            Mailbox::Dm(name) => Self::Dm(name),
        })
    }

    /// DM read check for this filter; only an explicit `@name` target can
    /// reach someone else's mailbox.
    pub fn check_access(&self, reader: Option<&str>, allow_override: bool) -> Result<(), MailError> {
        match self {
            Self::Dm(owner) => check_read(reader, &Mailbox::Dm(owner.clone()), allow_override),
            _ => Ok(()),
        }
    }

    pub fn matches(&self, mailbox: &Mailbox) -> bool {
        match (self, mailbox) {
            (Self::Everything, _) => true,
            (Self::AllTopics | Self::Inbox(_), Mailbox::Topic(_)) => true,
            (Self::Topic(want), Mailbox::Topic(name)) => want == name,
            (Self::Dm(want) | Self::Inbox(want), Mailbox::Dm(name)) => want == name,
            _ => false,
        }
    }

    /// Mailboxes currently on disk that this filter covers.
    pub fn mailboxes(&self, store: &MessageStore) -> Result<Vec<Mailbox>, MailError> {
        match self {
            Self::Topic(name) => Ok(vec![Mailbox::Topic(name.clone())]),
            Self::Dm(name) => Ok(vec![Mailbox::Dm(name.clone())]),
            _ => Ok(store
                .mailboxes()?
                .into_iter()
                .filter(|m| self.matches(m))
                .collect()),
        }
    }

    /// Every stored message this filter covers past `cursor`, in id order.
    pub fn read_since(
        &self,
        store: &MessageStore,
        cursor: Option<&Cursor>,
    ) -> Result<Vec<Message>, MailError> {
        let mut out = Vec::new();
        for mailbox in self.mailboxes(store)? {
            out.extend(store.list_since(&mailbox, cursor)?);
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }
}

use crate::error::MailError;
use crate::message::Mailbox;

/// Read check applied wherever a caller asks to read or watch a mailbox.
///
/// Topics are open to everyone. A DM mailbox is readable by its owner, or by
/// anyone who passes the explicit override.
pub fn check_read(
    reader: Option<&str>,
    mailbox: &Mailbox,
    allow_override: bool,
) -> Result<(), MailError> {
    match mailbox {
        Mailbox::Topic(_) => Ok(()),
        Mailbox::Dm(_) if allow_override => Ok(()),
        Mailbox::Dm(owner) if reader == Some(owner.as_str()) => Ok(()),
        Mailbox::Dm(_) => Err(MailError::AccessDenied {
            agent: reader.unwrap_or("anonymous").to_owned(),
            mailbox: mailbox.to_string(),
        }),
    }
}

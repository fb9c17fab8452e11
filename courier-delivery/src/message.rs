//! Reusable outbound message buffer
//!
//! A single [`Message`] is allocated per chunk and handed to every task's
//! content generation in turn, so [`Message::reset`] keeps the allocations
//! around instead of dropping them.

use mailparse::MailAddr;

use crate::error::MessageError;

const SENDER_HEADERS: [&str; 2] = ["Sender", "From"];
const RECIPIENT_HEADERS: [&str; 3] = ["To", "Cc", "Bcc"];

/// Sender and recipients as handed to [`Connection::send`](crate::Connection::send).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub sender: String,
    pub recipients: Vec<String>,
}

#[derive(Debug, Default, Clone)]
pub struct Message {
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl Message {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear every header and the body, keeping allocated capacity.
    pub fn reset(&mut self) {
        self.headers.clear();
        self.body.clear();
    }

    /// Replace all values of `name` (case-insensitively) with `value`.
    ///
    /// Line breaks in either are folded into spaces, so a header can never
    /// spill into another one on the wire.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = single_line(name.into());
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(&name));
        self.headers.push((name, single_line(value.into())));
    }

    /// Append a header, keeping any existing values of the same name.
    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers
            .push((single_line(name.into()), single_line(value.into())));
    }

    /// The first value of `name`, if present.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers_named(name).next()
    }

    fn headers_named<'a, 'n>(
        &'a self,
        name: &'n str,
    ) -> impl Iterator<Item = &'a str> + use<'a, 'n> {
        self.headers
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn set_body(&mut self, body: impl AsRef<[u8]>) {
        self.body.clear();
        self.body.extend_from_slice(body.as_ref());
    }

    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Derive the SMTP envelope from the message headers.
    ///
    /// The sender comes from `Sender`, falling back to `From`. Recipients are
    /// collected from `To`, `Cc` and `Bcc`, in that order.
    ///
    /// # Errors
    ///
    /// Returns an error if there is no sender, no recipient, or an address
    /// header fails to parse.
    pub fn envelope(&self) -> Result<Envelope, MessageError> {
        let sender = SENDER_HEADERS
            .iter()
            .find_map(|name| self.header(name).map(|value| (*name, value)))
            .ok_or(MessageError::MissingSender)
            .and_then(|(name, value)| {
                parse_addresses(name, value)?
                    .into_iter()
                    .next()
                    .ok_or(MessageError::MissingSender)
            })?;

        let mut recipients = Vec::new();
        for name in RECIPIENT_HEADERS {
            for value in self.headers_named(name) {
                recipients.extend(parse_addresses(name, value)?);
            }
        }

        if recipients.is_empty() {
            return Err(MessageError::NoRecipients);
        }

        Ok(Envelope { sender, recipients })
    }

    /// Render the message onto `out` with CRLF line endings.
    ///
    /// `Bcc` is part of the envelope only and is never written out.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        for (name, value) in &self.headers {
            if name.eq_ignore_ascii_case("Bcc") {
                continue;
            }
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");

        let mut previous = None;
        for &byte in &self.body {
            if byte == b'\n' && previous != Some(b'\r') {
                out.push(b'\r');
            }
            out.push(byte);
            previous = Some(byte);
        }
    }
}

fn single_line(text: String) -> String {
    if text.contains(['\r', '\n']) {
        text.replace(['\r', '\n'], " ")
    } else {
        text
    }
}

fn parse_addresses(header: &str, value: &str) -> Result<Vec<String>, MessageError> {
    let list = mailparse::addrparse(value).map_err(|e| MessageError::InvalidAddress {
        header: header.to_string(),
        reason: e.to_string(),
    })?;

    Ok(list
        .iter()
        .flat_map(|addr| match addr {
            MailAddr::Single(info) => vec![info.addr.clone()],
            MailAddr::Group(group) => group.addrs.iter().map(|info| info.addr.clone()).collect(),
        })
        .collect())
}

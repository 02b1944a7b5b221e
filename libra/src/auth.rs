//! Server-side authentication: the method-priority table, the SOCKS5
//! method negotiator, and the SOCKS4 user-id validator signature.
//!
//! Authentication handlers may hand back a replacement stream (the
//! "connection handoff through auth" design: a handler can splice in a
//! rate limiter or a framing wrapper). A handler that rejects returns
//! `None`.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::codec::socks4::UserIdAuthCode;
use crate::codec::socks5::method;
use crate::error::Error;
use crate::stream::{box_stream, DynStream, Stream};

/// A handler that may accept, reject, or rewrap the connection.
pub type ConnHandler = Arc<dyn Fn(DynStream) -> BoxFuture<'static, Option<DynStream>> + Send + Sync>;

/// The NOAUTH handler. Unlike [`ConnHandler`], it always hands the stream
/// back alongside its accept/reject verdict: NOAUTH has no wire
/// sub-protocol of its own, so a reject decision here can only be
/// signalled by the *caller* writing `{0x05, 0xFF}` to the still-live
/// stream, per spec.md §4.3/§8.
pub type NoAuthHandler = Arc<dyn Fn(DynStream) -> BoxFuture<'static, (DynStream, bool)> + Send + Sync>;

/// The RFC 1929 credential validator.
pub type PasswordValidator = Arc<dyn Fn(String, String) -> BoxFuture<'static, bool> + Send + Sync>;

/// The SOCKS4 user-id validator.
pub type UserIdValidator = Arc<dyn Fn(Vec<u8>) -> BoxFuture<'static, UserIdAuthCode> + Send + Sync>;

fn accept_handler() -> ConnHandler {
    Arc::new(|s| Box::pin(async move { Some(s) }))
}

fn accept_no_auth_handler() -> NoAuthHandler {
    Arc::new(|s| Box::pin(async move { (s, true) }))
}

/// The server-side SOCKS5 authentication configuration: one optional
/// handler + signed priority per category, plus sparse per-slot handlers
/// for the IANA (0x03..=0x7F) and PRIVATE (0x80..=0xFE) ranges.
#[derive(Clone, Default)]
pub struct S5AuthTable {
    no_auth: Option<(NoAuthHandler, i8)>,
    gssapi: Option<(ConnHandler, i8)>,
    password: Option<(PasswordValidator, i8)>,
    /// method code -> handler, for 0x03..=0x7F.
    iana: HashMap<u8, ConnHandler>,
    iana_priority: i8,
    /// method code -> handler, for 0x80..=0xFE.
    private: HashMap<u8, ConnHandler>,
    private_priority: i8,
}

impl S5AuthTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_no_auth(mut self, priority: i8) -> Self {
        self.no_auth = Some((accept_no_auth_handler(), priority));
        self
    }

    pub fn with_no_auth_handler(mut self, priority: i8, handler: NoAuthHandler) -> Self {
        self.no_auth = Some((handler, priority));
        self
    }

    pub fn with_gssapi(mut self, priority: i8, handler: ConnHandler) -> Self {
        self.gssapi = Some((handler, priority));
        self
    }

    pub fn with_password(mut self, priority: i8, validator: PasswordValidator) -> Self {
        self.password = Some((validator, priority));
        self
    }

    pub fn with_iana(mut self, priority: i8, code: u8, handler: ConnHandler) -> Self {
        assert!((method::IANA_MIN..=method::IANA_MAX).contains(&code));
        self.iana_priority = priority;
        self.iana.insert(code, handler);
        self
    }

    pub fn with_private(mut self, priority: i8, code: u8, handler: ConnHandler) -> Self {
        assert!((method::PRIVATE_MIN..=method::PRIVATE_MAX).contains(&code));
        self.private_priority = priority;
        self.private.insert(code, handler);
        self
    }

    /// Convenience constructor mirroring `go-socks`'s
    /// `SimplifySocks5Auth{}` (no credentials): NOAUTH only, priority 0.
    pub fn no_auth() -> Self {
        Self::new().with_no_auth(0)
    }

    /// Convenience constructor mirroring `SimplifySocks5Auth{User,
    /// Password}`: a single PASSWORD method validating against one fixed
    /// credential pair.
    pub fn password(user: impl Into<String>, pass: impl Into<String>) -> Self {
        let user = user.into();
        let pass = pass.into();
        Self::new().with_password(
            0,
            Arc::new(move |u, p| {
                let ok = u == user && p == pass;
                Box::pin(async move { ok })
            }),
        )
    }

    fn categories_by_priority(&self) -> Vec<u8> {
        let mut cats: Vec<(u8, i8)> = Vec::new();
        if let Some((_, pr)) = &self.no_auth {
            cats.push((method::NOAUTH, *pr));
        }
        if let Some((_, pr)) = &self.gssapi {
            cats.push((method::GSSAPI, *pr));
        }
        if let Some((_, pr)) = &self.password {
            cats.push((method::PASSWORD, *pr));
        }
        if !self.iana.is_empty() {
            cats.push((method::IANA_MIN, self.iana_priority));
        }
        if !self.private.is_empty() {
            cats.push((method::PRIVATE_MIN, self.private_priority));
        }
        cats.sort_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(&b.0)));
        cats.into_iter().map(|(c, _)| c).collect()
    }

    /// Whether this table has at least one enabled method, as spec.md §3
    /// requires of a constructed server.
    pub fn is_empty(&self) -> bool {
        self.no_auth.is_none()
            && self.gssapi.is_none()
            && self.password.is_none()
            && self.iana.is_empty()
            && self.private.is_empty()
    }

    /// Every method code this table would offer, in no particular order
    /// (used by the client side, which sends the full offered set rather
    /// than negotiating a priority order).
    pub fn offered_methods(&self) -> Vec<u8> {
        let mut out = Vec::new();
        if self.no_auth.is_some() {
            out.push(method::NOAUTH);
        }
        if self.gssapi.is_some() {
            out.push(method::GSSAPI);
        }
        if self.password.is_some() {
            out.push(method::PASSWORD);
        }
        out.extend(self.iana.keys().copied());
        out.extend(self.private.keys().copied());
        out
    }
}

/// Scans `table`'s categories in ascending-priority order (ties by
/// category code) and, within IANA/PRIVATE, ascending slot-code order,
/// returning the first method code both offered by the client and
/// backed by a configured handler. Mirrors
/// `go-socks/server/socks5.go:handleSocks5Auth`'s selection loop.
pub fn select_method(table: &S5AuthTable, offered: &[u8]) -> Option<u8> {
    let offered: std::collections::HashSet<u8> = offered.iter().copied().collect();
    for category in table.categories_by_priority() {
        match category {
            method::NOAUTH if offered.contains(&method::NOAUTH) => return Some(method::NOAUTH),
            method::GSSAPI if offered.contains(&method::GSSAPI) => return Some(method::GSSAPI),
            method::PASSWORD if offered.contains(&method::PASSWORD) => return Some(method::PASSWORD),
            method::IANA_MIN => {
                for code in method::IANA_MIN..=method::IANA_MAX {
                    if table.iana.contains_key(&code) && offered.contains(&code) {
                        return Some(code);
                    }
                }
            }
            method::PRIVATE_MIN => {
                for code in method::PRIVATE_MIN..=method::PRIVATE_MAX {
                    if table.private.contains_key(&code) && offered.contains(&code) {
                        return Some(code);
                    }
                }
            }
            _ => {}
        }
    }
    None
}

/// Runs the NOAUTH handler. Returns the (possibly rewrapped) stream and
/// whether it accepted the connection; the caller writes the
/// method-selection reply (`NOAUTH` or `REJECTED`) afterwards, since
/// NOAUTH has no wire sub-protocol of its own to carry that verdict.
pub async fn run_no_auth<S>(table: &S5AuthTable, stream: S) -> Result<(DynStream, bool), Error>
where
    S: Stream + 'static,
{
    let (handler, _) = table.no_auth.as_ref().ok_or(Error::NoAcceptableMethods)?;
    Ok(handler(box_stream(stream)).await)
}

/// Runs the method-specific sub-protocol for a chosen, non-rejected
/// method code (never `NOAUTH` — see [`run_no_auth`]). Returns the
/// (possibly rewrapped) stream on success.
pub async fn run_subnegotiation<S>(
    table: &S5AuthTable,
    chosen: u8,
    mut stream: S,
) -> Result<DynStream, Error>
where
    S: Stream + 'static,
{
    match chosen {
        method::GSSAPI => {
            let (handler, _) = table.gssapi.as_ref().ok_or(Error::NoAcceptableMethods)?;
            match handler(box_stream(stream)).await {
                Some(s) => Ok(s),
                None => Err(Error::AuthRejected),
            }
        }
        method::PASSWORD => {
            use crate::codec::socks5::{read_password, write_password_status};
            let (validator, _) = table.password.as_ref().ok_or(Error::NoAcceptableMethods)?;
            let (user, pass) = read_password(&mut stream).await?;
            let ok = validator(user, pass).await;
            write_password_status(&mut stream, ok).await?;
            if ok {
                Ok(box_stream(stream))
            } else {
                Err(Error::AuthRejected)
            }
        }
        code if (method::IANA_MIN..=method::IANA_MAX).contains(&code) => {
            let handler = table.iana.get(&code).ok_or(Error::NoAcceptableMethods)?;
            match handler(box_stream(stream)).await {
                Some(s) => Ok(s),
                None => Err(Error::AuthRejected),
            }
        }
        code if (method::PRIVATE_MIN..=method::PRIVATE_MAX).contains(&code) => {
            let handler = table.private.get(&code).ok_or(Error::NoAcceptableMethods)?;
            match handler(box_stream(stream)).await {
                Some(s) => Ok(s),
                None => Err(Error::AuthRejected),
            }
        }
        _ => Err(Error::NoAcceptableMethods),
    }
}

/// An error placeholder kept out of the normal auth flow: constructing a
/// server with an empty `S5AuthTable` (and SOCKS5 enabled) is a
/// configuration error, not a protocol error, caught at `Server::new`.
pub fn empty_table_error() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, "no socks5 authentication methods enabled")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_highest_priority_enabled_method_also_offered() {
        let table = S5AuthTable::new()
            .with_no_auth(5)
            .with_password(0, Arc::new(|_, _| Box::pin(async { true })));
        let chosen = select_method(&table, &[method::NOAUTH, method::PASSWORD]);
        assert_eq!(chosen, Some(method::PASSWORD));
    }

    #[test]
    fn falls_back_when_preferred_not_offered() {
        let table = S5AuthTable::new()
            .with_no_auth(5)
            .with_password(0, Arc::new(|_, _| Box::pin(async { true })));
        let chosen = select_method(&table, &[method::NOAUTH]);
        assert_eq!(chosen, Some(method::NOAUTH));
    }

    #[test]
    fn returns_none_when_nothing_overlaps() {
        let table = S5AuthTable::no_auth();
        assert_eq!(select_method(&table, &[method::PASSWORD]), None);
    }

    #[test]
    fn iana_scans_slots_in_ascending_code_order() {
        let table = S5AuthTable::new()
            .with_iana(0, 0x10, accept_handler())
            .with_iana(0, 0x05, accept_handler());
        let chosen = select_method(&table, &[0x10, 0x05]);
        assert_eq!(chosen, Some(0x05));
    }
}

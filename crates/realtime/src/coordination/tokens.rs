// Key namespaces for short-lived tokens issued by the surrounding system.
// The realtime server only stores and expires them; it never interprets them.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenNamespace {
    Session,
    MagicLink,
    Invite,
}

impl TokenNamespace {
    pub const fn prefix(self) -> &'static str {
        match self {
            Self::Session => "session",
            Self::MagicLink => "magic_link",
            Self::Invite => "invite",
        }
    }
}

impl fmt::Display for TokenNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

pub fn token_key(namespace: TokenNamespace, id: &str) -> String {
    format!("{}:{id}", namespace.prefix())
}

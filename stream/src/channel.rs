//! Channel URIs of the form `mem:endpoint?param=value|param=value`.
//!
//! The only media supported by the in-process transport is `mem`. The
//! endpoint names a mailbox shared by every subscription that has added it as
//! a destination. Recognised params include `session-id`, `alias`,
//! `control-mode`, `mtu`, `term-length`, `tags`, `init-term-id` and
//! `term-offset`; unknown params are carried verbatim.

use std::collections::BTreeMap;
use std::fmt;

pub const MEDIA: &str = "mem";
pub const SESSION_ID_PARAM: &str = "session-id";
pub const ALIAS_PARAM: &str = "alias";

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ChannelUri {
    endpoint: Option<String>,
    params: BTreeMap<String, String>,
}

impl ChannelUri {
    pub fn new(endpoint: &str) -> Self {
        Self {
            endpoint: if endpoint.is_empty() {
                None
            } else {
                Some(endpoint.to_string())
            },
            params: BTreeMap::new(),
        }
    }

    /// Parses `mem:endpoint?k=v|k=v`. The endpoint may be empty for
    /// manual-destination channels.
    pub fn parse(channel: &str) -> Self {
        let rest = channel.strip_prefix("mem:").unwrap_or(channel);
        let (endpoint, query) = match rest.split_once('?') {
            Some((endpoint, query)) => (endpoint, Some(query)),
            None => (rest, None),
        };

        let mut uri = ChannelUri::new(endpoint);
        if let Some(query) = query {
            for pair in query.split('|') {
                if let Some((key, value)) = pair.split_once('=') {
                    uri.params.insert(key.to_string(), value.to_string());
                }
            }
        }
        uri
    }

    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    pub fn set_endpoint(&mut self, endpoint: &str) -> &mut Self {
        self.endpoint = Some(endpoint.to_string());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    pub fn put(&mut self, key: &str, value: &str) -> &mut Self {
        self.params.insert(key.to_string(), value.to_string());
        self
    }

    pub fn session_id(&self) -> Option<i32> {
        self.get(SESSION_ID_PARAM).and_then(|v| v.parse().ok())
    }

    pub fn set_session_id(&mut self, session_id: i32) -> &mut Self {
        self.put(SESSION_ID_PARAM, &session_id.to_string())
    }

    /// Convenience for the common "same channel, pinned session" pattern.
    pub fn with_session_id(channel: &str, session_id: i32) -> String {
        let mut uri = Self::parse(channel);
        uri.set_session_id(session_id);
        uri.to_string()
    }
}

impl fmt::Display for ChannelUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", MEDIA, self.endpoint.as_deref().unwrap_or(""))?;
        let mut separator = '?';
        for (key, value) in &self.params {
            write!(f, "{}{}={}", separator, key, value)?;
            separator = '|';
        }
        Ok(())
    }
}

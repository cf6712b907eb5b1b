//! Recent-IP history kept on every user.
//!
//! Slot 0 holds the signup address and is never evicted; slots `1..CAPACITY`
//! are a sliding window of the most recent logins, oldest evicted first.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct IpHistory {
    anchor: Option<String>,
    recent: VecDeque<String>,
}

impl IpHistory {
    pub const CAPACITY: usize = 5;

    pub fn with_anchor(signup_ip: impl Into<String>) -> Self {
        Self { anchor: Some(signup_ip.into()), recent: VecDeque::new() }
    }

    /// Records an address. The first address ever recorded becomes the anchor.
    pub fn push(&mut self, ip: impl Into<String>) {
        let ip = ip.into();
        if self.anchor.is_none() {
            self.anchor = Some(ip);
            return;
        }
        if self.recent.len() == Self::CAPACITY - 1 {
            self.recent.pop_front();
        }
        self.recent.push_back(ip);
    }

    pub fn anchor(&self) -> Option<&str> {
        self.anchor.as_deref()
    }

    pub fn len(&self) -> usize {
        usize::from(self.anchor.is_some()) + self.recent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.anchor.is_none()
    }

    /// Anchor first, then the window oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.anchor.as_deref().into_iter().chain(self.recent.iter().map(String::as_str))
    }
}

impl From<Vec<String>> for IpHistory {
    fn from(entries: Vec<String>) -> Self {
        let mut history = IpHistory::default();
        let mut entries = entries.into_iter();
        history.anchor = entries.next();
        for ip in entries {
            history.push(ip);
        }
        history
    }
}

impl From<IpHistory> for Vec<String> {
    fn from(history: IpHistory) -> Self {
        history.anchor.into_iter().chain(history.recent).collect()
    }
}

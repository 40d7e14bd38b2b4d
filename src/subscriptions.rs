use std::collections::HashSet;

/// Ordered set of topics replayed on every (re)connect.
///
/// Owned by the connection actor; callers only see it through actor messages.
#[derive(Debug, Default, Clone)]
pub struct SubscriptionRegistry {
    order: Vec<String>,
    members: HashSet<String>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` when the topic was not already present.
    pub fn add(&mut self, topic: &str) -> bool {
        if self.members.contains(topic) {
            return false;
        }
        self.members.insert(topic.to_string());
        self.order.push(topic.to_string());
        true
    }

    /// Returns `true` when the topic was present.
    pub fn remove(&mut self, topic: &str) -> bool {
        if !self.members.remove(topic) {
            return false;
        }
        self.order.retain(|t| t != topic);
        true
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.members.contains(topic)
    }

    /// Topics in insertion order.
    pub fn snapshot(&self) -> Vec<String> {
        self.order.clone()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

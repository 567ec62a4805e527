//! Message types and the registry that maps wire keys back to them

use crate::error::{CoreError, CoreResult};
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;

/// A payload carried inside frames.
///
/// Typically implemented by an application enum with one variant per wire
/// type. `name` is the discriminator written to the wire and must match the
/// name the variant was registered under.
pub trait Message: Send + 'static {
    /// Wire name of this payload's type
    fn name(&self) -> &str;

    /// Serialize the payload body
    fn marshal(&self) -> CoreResult<Bytes>;
}

/// Turns a payload body back into a message.
pub type Unmarshal<M> = fn(&[u8]) -> CoreResult<M>;

struct Entry<M> {
    id: Option<u16>,
    unmarshal: Unmarshal<M>,
}

/// Lookup table from wire names and numeric ids to unmarshal functions.
///
/// Built once at startup and shared by the codecs through an `Arc`.
pub struct Registry<M> {
    by_name: HashMap<String, Entry<M>>,
    by_id: HashMap<u16, String>,
}

impl<M> Registry<M> {
    pub fn new() -> Self {
        Self {
            by_name: HashMap::new(),
            by_id: HashMap::new(),
        }
    }

    /// Register a payload type by name.
    pub fn register(&mut self, name: impl Into<String>, unmarshal: Unmarshal<M>) -> CoreResult<()> {
        self.insert(name.into(), None, unmarshal)
    }

    /// Register a payload type by name and numeric id.
    pub fn register_with_id(
        &mut self,
        id: u16,
        name: impl Into<String>,
        unmarshal: Unmarshal<M>,
    ) -> CoreResult<()> {
        if let Some(existing) = self.by_id.get(&id) {
            return Err(CoreError::registration(format!(
                "id {id} already registered for {existing}"
            )));
        }
        self.insert(name.into(), Some(id), unmarshal)
    }

    fn insert(&mut self, name: String, id: Option<u16>, unmarshal: Unmarshal<M>) -> CoreResult<()> {
        if name.is_empty() {
            return Err(CoreError::registration("empty message name"));
        }
        if name.len() > u8::MAX as usize {
            return Err(CoreError::registration(format!(
                "message name {name} longer than 255 bytes"
            )));
        }
        if self.by_name.contains_key(&name) {
            return Err(CoreError::registration(format!(
                "message {name} already registered"
            )));
        }
        if let Some(id) = id {
            self.by_id.insert(id, name.clone());
        }
        self.by_name.insert(name, Entry { id, unmarshal });
        Ok(())
    }

    /// Whether `name` has been registered
    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// Numeric id registered for `name`
    pub fn id_of(&self, name: &str) -> Option<u16> {
        self.by_name.get(name).and_then(|e| e.id)
    }

    /// Name registered for `id`
    pub fn name_of(&self, id: u16) -> Option<&str> {
        self.by_id.get(&id).map(String::as_str)
    }

    /// Decode a body registered under `name`.
    pub fn unmarshal(&self, name: &str, body: &[u8]) -> CoreResult<M> {
        let entry = self
            .by_name
            .get(name)
            .ok_or_else(|| CoreError::unknown(name))?;
        (entry.unmarshal)(body)
    }

    /// Decode a body registered under `id`.
    pub fn unmarshal_id(&self, id: u16, body: &[u8]) -> CoreResult<M> {
        let name = self
            .by_id
            .get(&id)
            .ok_or_else(|| CoreError::unknown(format!("#{id}")))?;
        self.unmarshal(name, body)
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

impl<M> Default for Registry<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> fmt::Debug for Registry<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.by_name.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("Registry").field("names", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    enum Msg {
        Ping(u8),
        Text(String),
    }

    fn ping(body: &[u8]) -> CoreResult<Msg> {
        body.first()
            .map(|b| Msg::Ping(*b))
            .ok_or_else(|| CoreError::protocol("empty ping"))
    }

    fn text(body: &[u8]) -> CoreResult<Msg> {
        Ok(Msg::Text(String::from_utf8_lossy(body).into_owned()))
    }

    #[test]
    fn test_lookup_by_name_and_id() {
        let mut reg = Registry::new();
        reg.register_with_id(7, "ping", ping).unwrap();
        reg.register("text", text).unwrap();

        assert_eq!(reg.unmarshal("ping", &[3]).unwrap(), Msg::Ping(3));
        assert_eq!(reg.unmarshal_id(7, &[4]).unwrap(), Msg::Ping(4));
        assert_eq!(reg.id_of("ping"), Some(7));
        assert_eq!(reg.id_of("text"), None);
        assert_eq!(reg.name_of(7), Some("ping"));
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn test_duplicates_rejected() {
        let mut reg = Registry::new();
        reg.register_with_id(1, "ping", ping).unwrap();

        assert!(matches!(
            reg.register("ping", text),
            Err(CoreError::Registration { .. })
        ));
        assert!(matches!(
            reg.register_with_id(1, "other", text),
            Err(CoreError::Registration { .. })
        ));
        assert!(reg.register("", text).is_err());
    }

    #[test]
    fn test_unknown_lookups() {
        let reg: Registry<Msg> = Registry::new();
        let err = reg.unmarshal("missing", b"").unwrap_err();
        assert!(err.is_recoverable());
        assert!(reg.unmarshal_id(9, b"").is_err());
    }
}

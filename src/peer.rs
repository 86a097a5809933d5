//! Radio peer identity.
//!
//! A [`Peer`] is what a scan yields and what a connection targets. Two peers
//! are the same peer when their identifiers match; names are advisory and
//! may be missing or shared between devices.

use std::{
   fmt,
   hash::{Hash, Hasher},
};

use smol_str::SmolStr;

/// Opaque, stable identifier of a radio peer (a MAC address on BlueZ).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(SmolStr);

impl PeerId {
   pub fn new(id: impl Into<SmolStr>) -> Self {
      Self(id.into())
   }

   pub fn as_str(&self) -> &str {
      self.0.as_str()
   }
}

impl fmt::Display for PeerId {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str(&self.0)
   }
}

impl From<&str> for PeerId {
   fn from(id: &str) -> Self {
      Self::new(id)
   }
}

impl From<String> for PeerId {
   fn from(id: String) -> Self {
      Self::new(id)
   }
}

impl From<SmolStr> for PeerId {
   fn from(id: SmolStr) -> Self {
      Self(id)
   }
}

/// A discoverable radio peer: identifier plus optional human-readable name.
#[derive(Debug, Clone)]
pub struct Peer {
   id: PeerId,
   name: Option<SmolStr>,
}

impl Peer {
   pub fn new(id: impl Into<PeerId>, name: Option<impl Into<SmolStr>>) -> Self {
      Self {
         id: id.into(),
         name: name.map(Into::into),
      }
   }

   /// A peer known only by its identifier.
   pub fn unnamed(id: impl Into<PeerId>) -> Self {
      Self {
         id: id.into(),
         name: None,
      }
   }

   pub fn id(&self) -> &PeerId {
      &self.id
   }

   pub fn name(&self) -> Option<&str> {
      self.name.as_deref()
   }

   /// Name shown to the user; falls back to the identifier.
   pub fn display_name(&self) -> SmolStr {
      match &self.name {
         Some(name) if !name.is_empty() => name.clone(),
         _ => self.id.0.clone(),
      }
   }
}

impl PartialEq for Peer {
   fn eq(&self, other: &Self) -> bool {
      self.id == other.id
   }
}

impl Eq for Peer {}

impl Hash for Peer {
   fn hash<H: Hasher>(&self, state: &mut H) {
      self.id.hash(state);
   }
}

impl fmt::Display for Peer {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      match &self.name {
         Some(name) => write!(f, "{name} ({})", self.id),
         None => write!(f, "{}", self.id),
      }
   }
}

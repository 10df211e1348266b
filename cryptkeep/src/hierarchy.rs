//! Dataset directory hierarchy as seen by the keystore.

use std::collections::BTreeMap;

use parking_lot::RwLock;

use crate::algorithm::CryptSetting;
use crate::error::{Error, Result};
use crate::ids::{DirId, ObjectId};
use crate::txg::TxContext;

/// Read access to the directory tree plus the one property write the
/// keystore performs.
pub trait DirTree: Send + Sync {
    /// Keychain object of `dir`, if it is encrypted.
    ///
    /// # Errors
    ///
    /// Returns `Error::NoSuchDirectory` if `dir` does not exist.
    fn keychain_obj(&self, dir: DirId) -> Result<Option<ObjectId>>;

    /// Directory whose key-source property `dir` inherits, `dir` itself
    /// for an encryption root.
    ///
    /// # Errors
    ///
    /// Returns `Error::NoKeychain` if no ancestor sets a key source.
    fn keysource_dir(&self, dir: DirId) -> Result<DirId>;

    /// Immediate children of `dir`.
    ///
    /// # Errors
    ///
    /// Returns `Error::NoSuchDirectory` if `dir` does not exist.
    fn children(&self, dir: DirId) -> Result<Vec<DirId>>;

    /// Effective encryption setting of `dir`; never `Inherit`.
    ///
    /// # Errors
    ///
    /// Returns `Error::NoSuchDirectory` if `dir` does not exist.
    fn encryption(&self, dir: DirId) -> Result<CryptSetting>;

    /// Records `keysource` and `salt` as local properties of `dir`.
    ///
    /// # Errors
    ///
    /// Returns `Error::NoSuchDirectory` if `dir` does not exist.
    fn set_keysource(
        &self,
        dir: DirId,
        keysource: Option<&str>,
        salt: Option<u64>,
        tx: &TxContext,
    ) -> Result<()>;
}

#[derive(Debug, Default)]
struct DirNode {
    parent: Option<DirId>,
    children: Vec<DirId>,
    keychain_obj: Option<ObjectId>,
    crypt: CryptSetting,
    keysource: Option<String>,
    salt: Option<u64>,
}

/// In-memory [`DirTree`].
#[derive(Debug, Default)]
pub struct MemDirTree {
    nodes: RwLock<BTreeMap<DirId, DirNode>>,
}

impl MemDirTree {
    /// Creates an empty tree.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a top-level directory.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidParams` if `dir` already exists.
    pub fn add_root(&self, dir: DirId) -> Result<()> {
        let mut nodes = self.nodes.write();
        if nodes.contains_key(&dir) {
            return Err(Error::InvalidParams(format!(
                "directory {dir} already exists"
            )));
        }
        nodes.insert(dir, DirNode::default());
        Ok(())
    }

    /// Adds `dir` beneath `parent`.
    ///
    /// # Errors
    ///
    /// Returns `Error::NoSuchDirectory` if `parent` is unknown and
    /// `Error::InvalidParams` if `dir` already exists.
    pub fn add_child(&self, parent: DirId, dir: DirId) -> Result<()> {
        let mut nodes = self.nodes.write();
        if nodes.contains_key(&dir) {
            return Err(Error::InvalidParams(format!(
                "directory {dir} already exists"
            )));
        }
        nodes
            .get_mut(&parent)
            .ok_or(Error::NoSuchDirectory(parent))?
            .children
            .push(dir);
        nodes.insert(
            dir,
            DirNode {
                parent: Some(parent),
                ..DirNode::default()
            },
        );
        Ok(())
    }

    /// Sets the local encryption property of `dir`.
    ///
    /// # Errors
    ///
    /// Returns `Error::NoSuchDirectory` if `dir` does not exist.
    pub fn set_encryption(&self, dir: DirId, crypt: CryptSetting) -> Result<()> {
        self.with_node(dir, |node| node.crypt = crypt)
    }

    /// Points `dir` at its keychain object, or clears it.
    ///
    /// # Errors
    ///
    /// Returns `Error::NoSuchDirectory` if `dir` does not exist.
    pub fn set_keychain_obj(&self, dir: DirId, obj: Option<ObjectId>) -> Result<()> {
        self.with_node(dir, |node| node.keychain_obj = obj)
    }

    /// Makes `dir` an encryption root by setting its key source locally.
    ///
    /// # Errors
    ///
    /// Returns `Error::NoSuchDirectory` if `dir` does not exist.
    pub fn set_local_keysource(&self, dir: DirId, keysource: &str) -> Result<()> {
        self.with_node(dir, |node| {
            node.keysource = Some(keysource.to_owned());
        })
    }

    /// Local key source of `dir`.
    #[must_use]
    pub fn local_keysource(&self, dir: DirId) -> Option<String> {
        self.nodes
            .read()
            .get(&dir)
            .and_then(|node| node.keysource.clone())
    }

    /// Local salt of `dir`.
    #[must_use]
    pub fn local_salt(&self, dir: DirId) -> Option<u64> {
        self.nodes.read().get(&dir).and_then(|node| node.salt)
    }

    fn with_node(&self, dir: DirId, f: impl FnOnce(&mut DirNode)) -> Result<()> {
        let mut nodes = self.nodes.write();
        f(nodes.get_mut(&dir).ok_or(Error::NoSuchDirectory(dir))?);
        Ok(())
    }
}

fn lookup(nodes: &BTreeMap<DirId, DirNode>, dir: DirId) -> Result<&DirNode> {
    nodes.get(&dir).ok_or(Error::NoSuchDirectory(dir))
}

impl DirTree for MemDirTree {
    fn keychain_obj(&self, dir: DirId) -> Result<Option<ObjectId>> {
        let nodes = self.nodes.read();
        Ok(lookup(&nodes, dir)?.keychain_obj)
    }

    fn keysource_dir(&self, dir: DirId) -> Result<DirId> {
        let nodes = self.nodes.read();
        let mut cursor = Some(dir);
        while let Some(id) = cursor {
            let node = lookup(&nodes, id)?;
            if node.keysource.is_some() {
                return Ok(id);
            }
            cursor = node.parent;
        }
        Err(Error::NoKeychain(dir))
    }

    fn children(&self, dir: DirId) -> Result<Vec<DirId>> {
        let nodes = self.nodes.read();
        Ok(lookup(&nodes, dir)?.children.clone())
    }

    fn encryption(&self, dir: DirId) -> Result<CryptSetting> {
        let nodes = self.nodes.read();
        let mut cursor = Some(dir);
        while let Some(id) = cursor {
            let node = lookup(&nodes, id)?;
            if node.crypt != CryptSetting::Inherit {
                return Ok(node.crypt);
            }
            cursor = node.parent;
        }
        Ok(CryptSetting::Off)
    }

    fn set_keysource(
        &self,
        dir: DirId,
        keysource: Option<&str>,
        salt: Option<u64>,
        _tx: &TxContext,
    ) -> Result<()> {
        self.with_node(dir, |node| {
            if let Some(keysource) = keysource {
                node.keysource = Some(keysource.to_owned());
            }
            if salt.is_some() {
                node.salt = salt;
            }
        })
    }
}

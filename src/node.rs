//! Component C: the in-memory node cache.
//!
//! Mirrors the subset of the backing tree the kernel has learned about.
//! Each node's `refcount` counts only its own outstanding kernel lookups.
//! The parent link is counted on the parent instead, per §4.C's reference
//! rules: attaching a child bumps the parent's `refcount` by one, and
//! detaching it releases that one reference back. The `Rc`/`Weak` pair
//! is only there to give each node a stable home in memory without
//! building a leaking reference cycle.

use std::cell::RefCell;
use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::rc::{Rc, Weak};

pub type NodeRef = Rc<RefCell<Node>>;

/// The root is always node id 1; real nodes start at 2.
pub const ROOT_NID: u64 = 1;

pub struct Node {
    nid: u64,
    generation: u64,
    name: OsString,
    parent: Option<Weak<RefCell<Node>>>,
    children: HashMap<OsString, NodeRef>,
    refcount: u64,
}

impl Node {
    pub fn nid(&self) -> u64 {
        self.nid
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn name(&self) -> &OsStr {
        &self.name
    }

    pub fn refcount(&self) -> u64 {
        self.refcount
    }

    pub fn parent(&self) -> Option<NodeRef> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn child(&self, name: &OsStr) -> Option<NodeRef> {
        self.children.get(name).cloned()
    }

    pub fn children(&self) -> impl Iterator<Item = (&OsStr, &NodeRef)> {
        self.children.iter().map(|(k, v)| (k.as_os_str(), v))
    }
}

/// Owns the whole tree and the nid/generation allocators.
pub struct NodeCache {
    root: NodeRef,
    by_nid: HashMap<u64, NodeRef>,
    next_nid: u64,
    next_gen: u64,
}

impl NodeCache {
    /// `root_path` is the absolute backing directory, stored verbatim as the
    /// root's name.
    pub fn new(root_path: OsString) -> Self {
        let root = Rc::new(RefCell::new(Node {
            nid: ROOT_NID,
            generation: 0,
            name: root_path,
            parent: None,
            children: HashMap::new(),
            // Seeded above zero so the root can never be released away; also
            // guarded explicitly in `release` regardless of this value.
            refcount: 2,
        }));
        let mut by_nid = HashMap::new();
        by_nid.insert(ROOT_NID, root.clone());
        NodeCache {
            root,
            by_nid,
            next_nid: 2,
            next_gen: 1,
        }
    }

    pub fn root(&self) -> NodeRef {
        self.root.clone()
    }

    /// Resolve a kernel-supplied nid. `1` always resolves to the root.
    pub fn resolve(&self, nid: u64) -> Option<NodeRef> {
        self.by_nid.get(&nid).cloned()
    }

    /// Look up an existing child of `parent` named `name`, creating a fresh
    /// node if none exists yet. The caller is responsible for having already
    /// `lstat`'d the backing path; this module never touches the backing
    /// filesystem directly, keeping the cache a pure in-memory structure.
    ///
    /// A freshly created node starts with `refcount = 0` (no outstanding
    /// lookups yet); attaching it bumps the *parent's* refcount by one for
    /// the parent link. The caller adds the node's own lookup reference via
    /// [`NodeCache::add_lookup_ref`] once the lookup-style reply is sent.
    pub fn get_or_create_child(&mut self, parent: &NodeRef, name: &OsStr) -> NodeRef {
        if let Some(existing) = parent.borrow().child(name) {
            return existing;
        }

        let nid = self.next_nid;
        self.next_nid += 1;
        let generation = self.next_gen;
        self.next_gen += 1;

        let child = Rc::new(RefCell::new(Node {
            nid,
            generation,
            name: name.to_os_string(),
            parent: Some(Rc::downgrade(parent)),
            children: HashMap::new(),
            refcount: 0,
        }));

        parent
            .borrow_mut()
            .children
            .insert(name.to_os_string(), child.clone());
        parent.borrow_mut().refcount += 1;
        self.by_nid.insert(nid, child.clone());
        child
    }

    /// Bump the refcount of a node that was just handed to the kernel in a
    /// lookup-style reply (LOOKUP, or the success path of MKNOD/MKDIR).
    pub fn add_lookup_ref(&mut self, node: &NodeRef) {
        node.borrow_mut().refcount += 1;
    }

    /// Detach `target` from its current parent and re-attach it under
    /// `new_parent` with `new_name`, evicting whatever `new_parent` already
    /// has at that name (matching POSIX rename-overwrite semantics, since the
    /// backing `rename(2)` call the caller performs right after this will do
    /// the same). Cache mutation happens before the caller's backing rename
    /// call; see the design notes on why that ordering is preserved.
    pub fn reparent(&mut self, target: &NodeRef, new_parent: &NodeRef, new_name: OsString) {
        self.detach_from_parent(target);

        if let Some(displaced) = new_parent.borrow().child(&new_name) {
            if !Rc::ptr_eq(&displaced, target) {
                self.evict(&displaced);
            }
        }

        target.borrow_mut().name = new_name.clone();
        target.borrow_mut().parent = Some(Rc::downgrade(new_parent));
        new_parent
            .borrow_mut()
            .children
            .insert(new_name, target.clone());
        new_parent.borrow_mut().refcount += 1;
    }

    /// Release `n` references on `node` (a FORGET with `nlookup == n`). Excess
    /// decrements below zero are logged and ignored rather than underflowing.
    /// Reaching zero destroys the node: it is spliced out of its parent's
    /// child list and the parent's own reference count is released in turn.
    pub fn release(&mut self, node: NodeRef, n: u64) {
        let new_count = {
            let mut node_mut = node.borrow_mut();
            if n > node_mut.refcount {
                log::warn!(
                    "forget({}) exceeds refcount {} for nid {}, clamping",
                    n,
                    node_mut.refcount,
                    node_mut.nid
                );
                node_mut.refcount = 0;
            } else {
                node_mut.refcount -= n;
            }
            node_mut.refcount
        };

        if new_count > 0 {
            return;
        }

        // Can't happen in practice: the root's refcount is seeded above zero
        // and nothing decrements it by enough to reach zero through normal
        // lookup/forget traffic. Guarded explicitly anyway.
        if node.borrow().is_root() {
            return;
        }

        self.evict(&node);
    }

    /// Remove `node` from the nid map and detach it from its parent,
    /// releasing one reference on the parent. Used both when a node's own
    /// refcount reaches zero and when a rename overwrites an existing
    /// destination entry.
    fn evict(&mut self, node: &NodeRef) {
        let nid = node.borrow().nid;
        self.by_nid.remove(&nid);
        self.detach_from_parent(node);
    }

    /// Remove `node` from its parent's child list and release the parent's
    /// one reference for the link, which may recursively destroy the parent.
    /// Leaves `node` itself untouched (its own refcount, if any, is not
    /// consulted here).
    fn detach_from_parent(&mut self, node: &NodeRef) {
        let parent = node.borrow_mut().parent.take().and_then(|weak| weak.upgrade());
        if let Some(parent) = parent {
            let name = node.borrow().name.clone();
            parent.borrow_mut().children.remove(&name);
            self.release(parent, 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> NodeCache {
        NodeCache::new(OsString::from("/backing"))
    }

    #[test]
    fn root_resolves_and_cannot_be_released_away() {
        let mut cache = cache();
        let root = cache.resolve(ROOT_NID).expect("root must resolve");
        assert!(root.borrow().is_root());
        cache.release(root.clone(), 1000);
        assert_eq!(cache.resolve(ROOT_NID).unwrap().borrow().nid(), ROOT_NID);
    }

    #[test]
    fn create_then_lookup_returns_same_node() {
        let mut cache = cache();
        let root = cache.root();
        let a = cache.get_or_create_child(&root, OsStr::new("a"));
        let a_again = cache.get_or_create_child(&root, OsStr::new("a"));
        assert!(Rc::ptr_eq(&a, &a_again));
        // No lookup has been recorded yet; the parent link lives on `root`.
        assert_eq!(a.borrow().refcount(), 0);
    }

    #[test]
    fn single_lookup_and_matching_forget_destroys_the_node() {
        let mut cache = cache();
        let root = cache.root();
        let a = cache.get_or_create_child(&root, OsStr::new("a"));
        let nid = a.borrow().nid();

        cache.add_lookup_ref(&a);
        assert_eq!(a.borrow().refcount(), 1);

        cache.release(a, 1);
        assert!(cache.resolve(nid).is_none(), "balanced lookup/forget must free the node");
        assert!(root.borrow().child(OsStr::new("a")).is_none());
    }

    #[test]
    fn forget_balancing_matches_spec_scenario_4() {
        let mut cache = cache();
        let root = cache.root();
        let a = cache.get_or_create_child(&root, OsStr::new("a"));
        let nid = a.borrow().nid();

        // three LOOKUPs
        cache.add_lookup_ref(&a);
        cache.add_lookup_ref(&a);
        cache.add_lookup_ref(&a);
        assert_eq!(a.borrow().refcount(), 3);

        cache.release(a.clone(), 2);
        assert_eq!(a.borrow().refcount(), 1);
        assert!(cache.resolve(nid).is_some());

        cache.release(a, 1);
        assert!(cache.resolve(nid).is_none());
    }

    #[test]
    fn forget_underflow_is_clamped_not_panicking() {
        let mut cache = cache();
        let root = cache.root();
        let a = cache.get_or_create_child(&root, OsStr::new("a"));
        cache.add_lookup_ref(&a);
        cache.release(a.clone(), 1000);
        assert!(cache.resolve(a.borrow().nid()).is_none());
    }

    #[test]
    fn sibling_uniqueness_holds_after_create() {
        let mut cache = cache();
        let root = cache.root();
        let a1 = cache.get_or_create_child(&root, OsStr::new("dup"));
        let a2 = cache.get_or_create_child(&root, OsStr::new("dup"));
        assert!(Rc::ptr_eq(&a1, &a2));
        assert_eq!(root.borrow().children().count(), 1);
    }

    #[test]
    fn rename_reparents_and_preserves_identity() {
        let mut cache = cache();
        let root = cache.root();
        let a = cache.get_or_create_child(&root, OsStr::new("a"));
        let x = cache.get_or_create_child(&a, OsStr::new("x"));
        let b = cache.get_or_create_child(&root, OsStr::new("b"));

        let x_nid = x.borrow().nid();
        let x_gen = x.borrow().generation();

        cache.reparent(&x, &b, OsString::from("y"));

        assert!(a.borrow().child(OsStr::new("x")).is_none());
        let y = b.borrow().child(OsStr::new("y")).expect("y must exist under b");
        assert_eq!(y.borrow().nid(), x_nid);
        assert_eq!(y.borrow().generation(), x_gen);
    }

    #[test]
    fn rename_onto_existing_destination_evicts_it() {
        let mut cache = cache();
        let root = cache.root();
        let a = cache.get_or_create_child(&root, OsStr::new("a"));
        let b = cache.get_or_create_child(&root, OsStr::new("b"));
        let b_nid = b.borrow().nid();

        cache.reparent(&a, &root, OsString::from("b"));

        assert!(cache.resolve(b_nid).is_none());
        let new_b = root.borrow().child(OsStr::new("b")).unwrap();
        assert!(Rc::ptr_eq(&new_b, &a));
    }

    #[test]
    fn directory_with_cached_children_is_not_destroyed_by_forget() {
        let mut cache = cache();
        let root = cache.root();
        let dir = cache.get_or_create_child(&root, OsStr::new("dir"));
        let dir_nid = dir.borrow().nid();
        let _child = cache.get_or_create_child(&dir, OsStr::new("x"));

        cache.add_lookup_ref(&dir);
        // Forgetting the one outstanding lookup leaves `dir`'s refcount at
        // one: the reference the cached child `x` holds on its parent.
        cache.release(dir, 1);
        assert!(cache.resolve(dir_nid).is_some(), "dir must survive while it has a cached child");
    }
}

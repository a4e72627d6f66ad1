use log::warn;
use parking_lot::{RwLock, RwLockWriteGuard};
use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::Arc;

use crate::buffer::{
    BufferPoolManager, PageId, ReadPageGuard, WritePageGuard, HEADER_PAGE_ID, INVALID_PAGE_ID,
};
use crate::error::{PetraError, PetraResult};
use crate::storage::codec::{
    BPlusTreeInternalPageCodec, BPlusTreeLeafPageCodec, BPlusTreePageCodec, HeaderPageCodec,
};
use crate::storage::index::comparator::KeyComparator;
use crate::storage::page::{
    BPlusTreeInternalPage, BPlusTreeLeafPage, BPlusTreePage, RecordId, TreeOp,
};

/// Per-operation latch bookkeeping for a descending writer: the exclusively
/// latched ancestor path, the root-id latch when still held, and pages
/// emptied by merges. Pages queued here are physically freed only after
/// every latch has been released.
#[derive(Debug, Default)]
pub struct Context<'a> {
    pub write_set: VecDeque<WritePageGuard>,
    pub root_latch_guard: Option<RwLockWriteGuard<'a, PageId>>,
    pub deleted_pages: Vec<PageId>,
}

impl<'a> Context<'a> {
    pub fn new() -> Self {
        Self {
            write_set: VecDeque::new(),
            root_latch_guard: None,
            deleted_pages: Vec::new(),
        }
    }

    /// Release every ancestor latch (and the root-id latch) once the
    /// current node is known to absorb the operation locally.
    pub fn release_ancestors(&mut self) {
        self.write_set.clear();
        self.root_latch_guard = None;
    }
}

/// Concurrent B+Tree over byte-string keys with a user-supplied comparator.
///
/// Readers descend with hand-over-hand shared latches; writers crab down
/// with exclusive latches, keeping the ancestor path latched until the
/// current node is safe for the operation. `root_page_id` is guarded by its
/// own reader-writer latch and every change is written through to this
/// index's record in the header page, so the tree can be reopened by name.
#[derive(Debug)]
pub struct BPlusTreeIndex {
    pub index_name: String,
    pub buffer_pool: Arc<BufferPoolManager>,
    pub comparator: KeyComparator,
    pub leaf_max_size: u32,
    pub internal_max_size: u32,
    root_page_id: RwLock<PageId>,
}

impl BPlusTreeIndex {
    /// Open the index named `index_name`, creating its header-page record
    /// when it does not exist yet.
    pub fn new(
        index_name: impl Into<String>,
        buffer_pool: Arc<BufferPoolManager>,
        comparator: KeyComparator,
        leaf_max_size: u32,
        internal_max_size: u32,
    ) -> PetraResult<Self> {
        assert!(leaf_max_size >= 2, "leaf_max_size must be at least 2");
        assert!(
            internal_max_size >= 3,
            "internal_max_size must be at least 3"
        );
        let index_name = index_name.into();

        let mut header_guard = buffer_pool.fetch_page_write(HEADER_PAGE_ID)?;
        let (mut header, _) = HeaderPageCodec::decode(header_guard.data())?;
        let root_page_id = match header.get_record(&index_name) {
            Some(root) => root,
            None => {
                header.insert_record(&index_name, INVALID_PAGE_ID);
                header_guard.overwrite(&HeaderPageCodec::encode(&header));
                INVALID_PAGE_ID
            }
        };
        drop(header_guard);

        Ok(Self {
            index_name,
            buffer_pool,
            comparator,
            leaf_max_size,
            internal_max_size,
            root_page_id: RwLock::new(root_page_id),
        })
    }

    pub fn is_empty(&self) -> bool {
        *self.root_page_id.read() == INVALID_PAGE_ID
    }

    pub fn get_root_page_id(&self) -> PageId {
        *self.root_page_id.read()
    }

    /// Point lookup. Descends with shared latches, releasing each parent
    /// only after the child is latched.
    pub fn get_value(&self, key: &[u8]) -> PetraResult<Option<RecordId>> {
        let Some(guard) = self.find_leaf_page(key)? else {
            return Ok(None);
        };
        let leaf = self.decode_leaf(guard.data())?;
        Ok(leaf.look_up(key))
    }

    /// Insert a unique key. Returns Ok(false) when the key already exists.
    pub fn insert(&self, key: &[u8], rid: RecordId) -> PetraResult<bool> {
        let mut context = Context::new();
        let root_latch = self.root_page_id.write();
        if *root_latch == INVALID_PAGE_ID {
            return self.start_new_tree(root_latch, key, rid);
        }
        context.root_latch_guard = Some(root_latch);

        let mut leaf_guard = self.find_leaf_page_exclusive(key, TreeOp::Insert, &mut context)?;
        let mut leaf = self.decode_leaf(leaf_guard.data())?;
        if !leaf.insert(key, rid) {
            drop(leaf_guard);
            self.finish(context)?;
            return Ok(false);
        }

        if leaf.header.current_size >= leaf.header.max_size {
            // split: the new right sibling takes the upper half and its
            // first key becomes the separator pushed into the parent
            let new_guard = self.buffer_pool.new_page()?;
            let new_page_id = new_guard.page_id();
            let mut new_leaf = BPlusTreeLeafPage::new_with_comparator(
                new_page_id,
                leaf.header.parent_page_id,
                self.leaf_max_size,
                self.comparator,
            );
            new_leaf.extend(leaf.split_off(leaf.min_size() as usize));
            new_leaf.header.next_page_id = leaf.header.next_page_id;
            leaf.header.next_page_id = new_page_id;
            let separator = new_leaf.key_at(0).to_vec();
            self.insert_into_parent(
                BPlusTreePage::Leaf(leaf),
                leaf_guard,
                separator,
                BPlusTreePage::Leaf(new_leaf),
                new_guard,
                &mut context,
            )?;
        } else {
            leaf_guard.overwrite(&BPlusTreeLeafPageCodec::encode(&leaf));
            drop(leaf_guard);
        }
        self.finish(context)?;
        Ok(true)
    }

    /// Delete a key. Removing an absent key is a no-op.
    pub fn remove(&self, key: &[u8]) -> PetraResult<()> {
        let mut context = Context::new();
        let root_latch = self.root_page_id.write();
        if *root_latch == INVALID_PAGE_ID {
            return Ok(());
        }
        context.root_latch_guard = Some(root_latch);

        let mut leaf_guard = self.find_leaf_page_exclusive(key, TreeOp::Delete, &mut context)?;
        let mut leaf = self.decode_leaf(leaf_guard.data())?;
        if !leaf.delete(key) {
            drop(leaf_guard);
            return self.finish(context);
        }

        if leaf.header.parent_page_id == INVALID_PAGE_ID {
            // the root leaf is exempt from the minimum; an empty root leaf
            // resets the whole tree
            if leaf.header.current_size == 0 {
                let old_root_id = leaf.header.page_id;
                drop(leaf_guard);
                let root_latch = context.root_latch_guard.as_mut().ok_or_else(|| {
                    PetraError::Internal(
                        "root latch released before root leaf emptied".to_string(),
                    )
                })?;
                **root_latch = INVALID_PAGE_ID;
                self.sync_root_to_header(INVALID_PAGE_ID)?;
                context.deleted_pages.push(old_root_id);
            } else {
                leaf_guard.overwrite(&BPlusTreeLeafPageCodec::encode(&leaf));
                drop(leaf_guard);
            }
            return self.finish(context);
        }

        leaf_guard.overwrite(&BPlusTreeLeafPageCodec::encode(&leaf));
        if leaf.header.current_size < leaf.min_size() {
            self.handle_underflow(BPlusTreePage::Leaf(leaf), leaf_guard, &mut context)?;
        } else {
            drop(leaf_guard);
        }
        self.finish(context)
    }

    /// Leftmost leaf, shared-latched.
    pub fn find_leftmost_leaf(&self) -> PetraResult<Option<ReadPageGuard>> {
        let root_latch = self.root_page_id.read();
        if *root_latch == INVALID_PAGE_ID {
            return Ok(None);
        }
        let mut guard = self.buffer_pool.fetch_page_read(*root_latch)?;
        drop(root_latch);
        loop {
            match self.decode_page(guard.data())? {
                BPlusTreePage::Leaf(_) => return Ok(Some(guard)),
                BPlusTreePage::Internal(internal) => {
                    let child_guard = self.buffer_pool.fetch_page_read(internal.value_at(0))?;
                    guard = child_guard;
                }
            }
        }
    }

    /// Leaf that owns `key`'s position, shared-latched via hand-over-hand
    /// descent.
    pub fn find_leaf_page(&self, key: &[u8]) -> PetraResult<Option<ReadPageGuard>> {
        let root_latch = self.root_page_id.read();
        if *root_latch == INVALID_PAGE_ID {
            return Ok(None);
        }
        let mut guard = self.buffer_pool.fetch_page_read(*root_latch)?;
        drop(root_latch);
        loop {
            match self.decode_page(guard.data())? {
                BPlusTreePage::Leaf(_) => return Ok(Some(guard)),
                BPlusTreePage::Internal(internal) => {
                    let child_id = internal.look_up(key);
                    // child latched before the parent guard is replaced
                    let child_guard = self.buffer_pool.fetch_page_read(child_id)?;
                    guard = child_guard;
                }
            }
        }
    }

    /// Exclusive descent for writers: ancestors stay latched until the
    /// current node is safe, at which point the whole retained path (and
    /// the root-id latch) is released.
    fn find_leaf_page_exclusive(
        &self,
        key: &[u8],
        op: TreeOp,
        context: &mut Context<'_>,
    ) -> PetraResult<WritePageGuard> {
        let root_id = **context
            .root_latch_guard
            .as_ref()
            .expect("exclusive descent requires the root-id latch");
        let mut guard = self.buffer_pool.fetch_page_write(root_id)?;
        let mut is_root = true;
        loop {
            let page = self.decode_page(guard.data())?;
            if page.is_safe(op, is_root) {
                context.release_ancestors();
            }
            match page {
                BPlusTreePage::Leaf(_) => return Ok(guard),
                BPlusTreePage::Internal(internal) => {
                    let child_id = internal.look_up(key);
                    context.write_set.push_back(guard);
                    guard = self.buffer_pool.fetch_page_write(child_id)?;
                    is_root = false;
                }
            }
        }
    }

    fn start_new_tree(
        &self,
        mut root_latch: RwLockWriteGuard<'_, PageId>,
        key: &[u8],
        rid: RecordId,
    ) -> PetraResult<bool> {
        let mut root_guard = self.buffer_pool.new_page()?;
        let root_page_id = root_guard.page_id();
        let mut leaf = BPlusTreeLeafPage::new_with_comparator(
            root_page_id,
            INVALID_PAGE_ID,
            self.leaf_max_size,
            self.comparator,
        );
        leaf.insert(key, rid);
        root_guard.overwrite(&BPlusTreeLeafPageCodec::encode(&leaf));
        drop(root_guard);
        *root_latch = root_page_id;
        self.sync_root_to_header(root_page_id)?;
        Ok(true)
    }

    /// Wire a freshly split-off sibling into the parent, splitting upward
    /// as long as parents overflow. Writes the final images of both halves.
    fn insert_into_parent(
        &self,
        mut left_page: BPlusTreePage,
        mut left_guard: WritePageGuard,
        separator: Vec<u8>,
        mut right_page: BPlusTreePage,
        mut right_guard: WritePageGuard,
        context: &mut Context<'_>,
    ) -> PetraResult<()> {
        if left_page.parent_page_id() == INVALID_PAGE_ID {
            // the root split: grow the tree by one level
            let mut new_root_guard = self.buffer_pool.new_page()?;
            let new_root_id = new_root_guard.page_id();
            let mut new_root = BPlusTreeInternalPage::new_with_comparator(
                new_root_id,
                INVALID_PAGE_ID,
                self.internal_max_size,
                self.comparator,
            );
            new_root.populate_new_root(left_page.page_id(), separator, right_page.page_id());
            left_page.set_parent_page_id(new_root_id);
            right_page.set_parent_page_id(new_root_id);
            new_root_guard.overwrite(&BPlusTreeInternalPageCodec::encode(&new_root));
            left_guard.overwrite(&BPlusTreePageCodec::encode(&left_page));
            right_guard.overwrite(&BPlusTreePageCodec::encode(&right_page));
            drop(new_root_guard);
            drop(left_guard);
            drop(right_guard);

            let root_latch = context.root_latch_guard.as_mut().ok_or_else(|| {
                PetraError::Internal("root latch released before root split".to_string())
            })?;
            **root_latch = new_root_id;
            self.sync_root_to_header(new_root_id)?;
            return Ok(());
        }

        let mut parent_guard = context.write_set.pop_back().ok_or_else(|| {
            PetraError::Internal("splitting node has no latched parent".to_string())
        })?;
        let mut parent = self.decode_internal(parent_guard.data())?;
        right_page.set_parent_page_id(parent.header.page_id);
        parent.insert(separator, right_page.page_id());
        left_guard.overwrite(&BPlusTreePageCodec::encode(&left_page));
        right_guard.overwrite(&BPlusTreePageCodec::encode(&right_page));
        drop(left_guard);
        drop(right_guard);

        if parent.header.current_size > parent.header.max_size {
            // internal overflow: move the upper half, promote the first
            // moved key, and re-parent the moved children
            let new_guard = self.buffer_pool.new_page()?;
            let new_page_id = new_guard.page_id();
            let mut new_internal = BPlusTreeInternalPage::new_with_comparator(
                new_page_id,
                parent.header.parent_page_id,
                self.internal_max_size,
                self.comparator,
            );
            let mut moved = parent.split_off(parent.min_size() as usize);
            let promoted = std::mem::take(&mut moved[0].0);
            let moved_children: Vec<PageId> = moved.iter().map(|kv| kv.1).collect();
            new_internal.extend(moved);
            for child_id in moved_children {
                self.update_parent_pointer(child_id, new_page_id)?;
            }
            return self.insert_into_parent(
                BPlusTreePage::Internal(parent),
                parent_guard,
                promoted,
                BPlusTreePage::Internal(new_internal),
                new_guard,
                context,
            );
        }

        parent_guard.overwrite(&BPlusTreeInternalPageCodec::encode(&parent));
        drop(parent_guard);
        Ok(())
    }

    /// Fix a node that dropped below its minimum: redistribute from a
    /// sibling when the pair can cover two nodes, merge otherwise.
    ///
    /// Sibling latches are taken in leaf-chain order (left before right),
    /// the same order readers crab along the leaf list. Reaching the left
    /// sibling therefore requires releasing the node and re-latching both
    /// in order; the parent stays latched throughout, so the node's image
    /// cannot change in between.
    fn handle_underflow(
        &self,
        node: BPlusTreePage,
        node_guard: WritePageGuard,
        context: &mut Context<'_>,
    ) -> PetraResult<()> {
        let mut parent_guard = context.write_set.pop_back().ok_or_else(|| {
            PetraError::Internal("underflowing node has no latched parent".to_string())
        })?;
        let mut parent = self.decode_internal(parent_guard.data())?;
        let node_id = node.page_id();
        let node_idx = parent.child_index(node_id).ok_or_else(|| {
            PetraError::Internal("underflowing node missing from its parent".to_string())
        })?;
        let (left_id, right_id) = parent.sibling_page_ids(node_id);
        let capacity = match &node {
            BPlusTreePage::Leaf(page) => page.header.max_size,
            BPlusTreePage::Internal(page) => page.header.max_size + 1,
        };

        let (mut node, mut node_guard, left) = match left_id {
            Some(id) => {
                drop(node_guard);
                let left_guard = self.buffer_pool.fetch_page_write(id)?;
                let node_guard = self.buffer_pool.fetch_page_write(node_id)?;
                let node = self.decode_page(node_guard.data())?;
                let left_page = self.decode_page(left_guard.data())?;
                (node, node_guard, Some((left_page, left_guard)))
            }
            None => (node, node_guard, None),
        };
        let right = match right_id {
            Some(id) => {
                let guard = self.buffer_pool.fetch_page_write(id)?;
                let page = self.decode_page(guard.data())?;
                Some((page, guard))
            }
            None => None,
        };

        let can_borrow_left = left
            .as_ref()
            .map(|(page, _)| page.current_size() + node.current_size() >= capacity)
            .unwrap_or(false);
        let can_borrow_right = right
            .as_ref()
            .map(|(page, _)| page.current_size() + node.current_size() >= capacity)
            .unwrap_or(false);

        if can_borrow_left {
            let (mut left_page, mut left_guard) = left.unwrap();
            drop(right);
            self.borrow_from_left(&mut left_page, &mut node, &mut parent, node_idx)?;
            left_guard.overwrite(&BPlusTreePageCodec::encode(&left_page));
            node_guard.overwrite(&BPlusTreePageCodec::encode(&node));
            parent_guard.overwrite(&BPlusTreeInternalPageCodec::encode(&parent));
            return Ok(());
        }
        if can_borrow_right {
            let (mut right_page, mut right_guard) = right.unwrap();
            drop(left);
            self.borrow_from_right(&mut right_page, &mut node, &mut parent, node_idx)?;
            right_guard.overwrite(&BPlusTreePageCodec::encode(&right_page));
            node_guard.overwrite(&BPlusTreePageCodec::encode(&node));
            parent_guard.overwrite(&BPlusTreeInternalPageCodec::encode(&parent));
            return Ok(());
        }

        if let Some((left_page, left_guard)) = left {
            drop(right);
            return self.merge_nodes(
                left_page,
                left_guard,
                node,
                node_guard,
                parent,
                parent_guard,
                context,
            );
        }
        let (right_page, right_guard) = right.ok_or_else(|| {
            PetraError::Internal("underflowing non-root node has no siblings".to_string())
        })?;
        self.merge_nodes(
            node,
            node_guard,
            right_page,
            right_guard,
            parent,
            parent_guard,
            context,
        )
    }

    fn borrow_from_left(
        &self,
        left: &mut BPlusTreePage,
        node: &mut BPlusTreePage,
        parent: &mut BPlusTreeInternalPage,
        node_idx: usize,
    ) -> PetraResult<()> {
        match (left, node) {
            (BPlusTreePage::Leaf(left), BPlusTreePage::Leaf(node)) => {
                let (key, rid) = left.pop_last();
                parent.set_key_at(node_idx, key.clone());
                node.push_first((key, rid));
            }
            (BPlusTreePage::Internal(left), BPlusTreePage::Internal(node)) => {
                // the separator rotates through the parent
                let (moved_key, moved_child) = left.pop_last();
                let old_separator = parent.key_at(node_idx).to_vec();
                node.push_first(moved_child, old_separator);
                parent.set_key_at(node_idx, moved_key);
                self.update_parent_pointer(moved_child, node.header.page_id)?;
            }
            _ => {
                return Err(PetraError::Internal(
                    "redistribute: mismatched sibling page types".to_string(),
                ))
            }
        }
        Ok(())
    }

    fn borrow_from_right(
        &self,
        right: &mut BPlusTreePage,
        node: &mut BPlusTreePage,
        parent: &mut BPlusTreeInternalPage,
        node_idx: usize,
    ) -> PetraResult<()> {
        let right_idx = node_idx + 1;
        match (right, node) {
            (BPlusTreePage::Leaf(right), BPlusTreePage::Leaf(node)) => {
                let (key, rid) = right.pop_first();
                node.push_last((key, rid));
                parent.set_key_at(right_idx, right.key_at(0).to_vec());
            }
            (BPlusTreePage::Internal(right), BPlusTreePage::Internal(node)) => {
                let (rotated_key, moved_child) = right.pop_first();
                let old_separator = parent.key_at(right_idx).to_vec();
                node.push_last(old_separator, moved_child);
                parent.set_key_at(right_idx, rotated_key);
                self.update_parent_pointer(moved_child, node.header.page_id)?;
            }
            _ => {
                return Err(PetraError::Internal(
                    "redistribute: mismatched sibling page types".to_string(),
                ))
            }
        }
        Ok(())
    }

    /// Concatenate `victim` (the right node of the pair) into `survivor`,
    /// drop their separator from the parent, and propagate a parent
    /// underflow upward.
    #[allow(clippy::too_many_arguments)]
    fn merge_nodes(
        &self,
        mut survivor: BPlusTreePage,
        mut survivor_guard: WritePageGuard,
        victim: BPlusTreePage,
        victim_guard: WritePageGuard,
        mut parent: BPlusTreeInternalPage,
        mut parent_guard: WritePageGuard,
        context: &mut Context<'_>,
    ) -> PetraResult<()> {
        let victim_id = victim.page_id();
        let victim_idx = parent.child_index(victim_id).ok_or_else(|| {
            PetraError::Internal("merge victim missing from its parent".to_string())
        })?;
        let (separator, _) = parent.remove_at(victim_idx);

        match (&mut survivor, victim) {
            (BPlusTreePage::Leaf(survivor), BPlusTreePage::Leaf(victim)) => {
                survivor.header.next_page_id = victim.header.next_page_id;
                survivor.extend(victim.array);
            }
            (BPlusTreePage::Internal(survivor), BPlusTreePage::Internal(victim)) => {
                // the separator comes down onto the victim's sentinel slot
                let mut moved = victim.array;
                moved[0].0 = separator;
                let moved_children: Vec<PageId> = moved.iter().map(|kv| kv.1).collect();
                survivor.extend(moved);
                for child_id in moved_children {
                    self.update_parent_pointer(child_id, survivor.header.page_id)?;
                }
            }
            _ => {
                return Err(PetraError::Internal(
                    "merge: mismatched sibling page types".to_string(),
                ))
            }
        }

        survivor_guard.overwrite(&BPlusTreePageCodec::encode(&survivor));
        drop(survivor_guard);
        drop(victim_guard);
        context.deleted_pages.push(victim_id);

        if parent.header.parent_page_id == INVALID_PAGE_ID {
            // the parent is the root
            if parent.header.current_size == 1 {
                // a single child is left: it becomes the new root
                let new_root_id = parent.value_at(0);
                let old_root_id = parent.header.page_id;
                self.update_parent_pointer(new_root_id, INVALID_PAGE_ID)?;
                drop(parent_guard);
                let root_latch = context.root_latch_guard.as_mut().ok_or_else(|| {
                    PetraError::Internal(
                        "root latch released before root height shrink".to_string(),
                    )
                })?;
                **root_latch = new_root_id;
                self.sync_root_to_header(new_root_id)?;
                context.deleted_pages.push(old_root_id);
            } else {
                parent_guard.overwrite(&BPlusTreeInternalPageCodec::encode(&parent));
                drop(parent_guard);
            }
            return Ok(());
        }

        parent_guard.overwrite(&BPlusTreeInternalPageCodec::encode(&parent));
        if parent.header.current_size < parent.min_size() {
            return self.handle_underflow(
                BPlusTreePage::Internal(parent),
                parent_guard,
                context,
            );
        }
        drop(parent_guard);
        Ok(())
    }

    fn update_parent_pointer(&self, page_id: PageId, parent_page_id: PageId) -> PetraResult<()> {
        let mut guard = self.buffer_pool.fetch_page_write(page_id)?;
        let mut page = self.decode_page(guard.data())?;
        page.set_parent_page_id(parent_page_id);
        guard.overwrite(&BPlusTreePageCodec::encode(&page));
        Ok(())
    }

    /// Write the current root id through to this index's header record.
    /// Callers hold the root-id latch.
    fn sync_root_to_header(&self, root_page_id: PageId) -> PetraResult<()> {
        let mut header_guard = self.buffer_pool.fetch_page_write(HEADER_PAGE_ID)?;
        let (mut header, _) = HeaderPageCodec::decode(header_guard.data())?;
        header.upsert_record(&self.index_name, root_page_id);
        header_guard.overwrite(&HeaderPageCodec::encode(&header));
        Ok(())
    }

    /// Drop every latch still held, then free pages emptied by merges.
    fn finish(&self, mut context: Context<'_>) -> PetraResult<()> {
        context.write_set.clear();
        context.root_latch_guard = None;
        for page_id in std::mem::take(&mut context.deleted_pages) {
            if !self.buffer_pool.delete_page(page_id)? {
                warn!("page {} still pinned, skipping physical delete", page_id);
            }
        }
        Ok(())
    }

    fn decode_page(&self, bytes: &[u8]) -> PetraResult<BPlusTreePage> {
        BPlusTreePageCodec::decode(bytes, self.comparator).map(|(page, _)| page)
    }

    fn decode_leaf(&self, bytes: &[u8]) -> PetraResult<BPlusTreeLeafPage> {
        BPlusTreeLeafPageCodec::decode(bytes, self.comparator).map(|(page, _)| page)
    }

    fn decode_internal(&self, bytes: &[u8]) -> PetraResult<BPlusTreeInternalPage> {
        BPlusTreeInternalPageCodec::decode(bytes, self.comparator).map(|(page, _)| page)
    }

    /// Graphviz dump for debugging.
    pub fn to_dot(&self) -> PetraResult<String> {
        let mut dot = String::new();
        writeln!(&mut dot, "digraph BPlusTree {{").unwrap();
        writeln!(&mut dot, "  node [shape=record];").unwrap();

        let root_page_id = self.get_root_page_id();
        if root_page_id == INVALID_PAGE_ID {
            writeln!(&mut dot, "  empty [label=\"empty tree\"];").unwrap();
            writeln!(&mut dot, "}}").unwrap();
            return Ok(dot);
        }

        let mut queue = VecDeque::new();
        queue.push_back(root_page_id);
        while let Some(page_id) = queue.pop_front() {
            let guard = self.buffer_pool.fetch_page_read(page_id)?;
            let page = self.decode_page(guard.data())?;
            drop(guard);
            match page {
                BPlusTreePage::Internal(internal) => {
                    let mut label = String::new();
                    for i in 1..internal.header.current_size as usize {
                        if i > 1 {
                            label.push('|');
                        }
                        write!(&mut label, "{:?}", internal.key_at(i)).unwrap();
                    }
                    writeln!(&mut dot, "  page{} [label=\"{}\"];", page_id, label).unwrap();
                    for child_id in internal.children() {
                        writeln!(&mut dot, "  page{} -> page{};", page_id, child_id).unwrap();
                        queue.push_back(child_id);
                    }
                }
                BPlusTreePage::Leaf(leaf) => {
                    let mut label = String::new();
                    for (i, (key, _)) in leaf.array.iter().enumerate() {
                        if i > 0 {
                            label.push('|');
                        }
                        write!(&mut label, "{:?}", key).unwrap();
                    }
                    writeln!(&mut dot, "  page{} [label=\"{}\"];", page_id, label).unwrap();
                    if leaf.header.next_page_id != INVALID_PAGE_ID {
                        writeln!(
                            &mut dot,
                            "  page{} -> page{} [style=dashed];",
                            page_id, leaf.header.next_page_id
                        )
                        .unwrap();
                    }
                }
            }
        }
        writeln!(&mut dot, "}}").unwrap();
        Ok(dot)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::thread;
    use tempfile::TempDir;

    use super::BPlusTreeIndex;
    use crate::buffer::{BufferPoolManager, INVALID_PAGE_ID};
    use crate::storage::codec::BPlusTreePageCodec;
    use crate::storage::disk_manager::DiskManager;
    use crate::storage::disk_scheduler::DiskScheduler;
    use crate::storage::index::comparator::default_comparator;
    use crate::storage::index::TreeIndexIterator;
    use crate::storage::page::{BPlusTreePage, RecordId};

    fn create_test_index(
        buffer_pool_size: usize,
        leaf_max_size: u32,
        internal_max_size: u32,
    ) -> (TempDir, Arc<BPlusTreeIndex>) {
        let temp_dir = TempDir::new().unwrap();
        let db_file = temp_dir.path().join("test.db");
        let disk_manager = Arc::new(DiskManager::try_new(db_file).unwrap());
        let disk_scheduler = Arc::new(DiskScheduler::new(disk_manager));
        let buffer_pool = Arc::new(BufferPoolManager::new(buffer_pool_size, disk_scheduler));
        let index = BPlusTreeIndex::new(
            "test_index",
            buffer_pool,
            default_comparator,
            leaf_max_size,
            internal_max_size,
        )
        .unwrap();
        (temp_dir, Arc::new(index))
    }

    /// Order-preserving big-endian encoding of a signed key.
    fn key(i: i64) -> Vec<u8> {
        ((i as u64) ^ 0x8000_0000_0000_0000).to_be_bytes().to_vec()
    }

    fn rid(i: i64) -> RecordId {
        RecordId::new((i >> 32) as i32, (i & 0xFFFF_FFFF) as u32)
    }

    /// Walks the whole tree and checks the structural invariants: equal
    /// leaf depth, size bounds on non-root nodes, strictly ascending keys,
    /// and that the leaf chain visits every key exactly once in order.
    fn check_tree_integrity(index: &Arc<BPlusTreeIndex>, expected_keys: &[i64]) {
        let root_page_id = index.get_root_page_id();
        if root_page_id == INVALID_PAGE_ID {
            assert!(expected_keys.is_empty(), "tree is empty but keys expected");
            return;
        }

        let mut leaf_depths = vec![];
        let mut queue = VecDeque::new();
        queue.push_back((root_page_id, 0usize));
        while let Some((page_id, depth)) = queue.pop_front() {
            let guard = index.buffer_pool.fetch_page_read(page_id).unwrap();
            let (page, _) = BPlusTreePageCodec::decode(guard.data(), default_comparator).unwrap();
            drop(guard);
            let is_root = page_id == root_page_id;
            match page {
                BPlusTreePage::Internal(internal) => {
                    assert!(
                        is_root || internal.header.current_size >= internal.min_size(),
                        "internal page {} under minimum",
                        page_id
                    );
                    assert!(
                        !is_root || internal.header.current_size >= 2,
                        "internal root must keep at least two children"
                    );
                    assert!(internal.header.current_size <= internal.header.max_size);
                    for i in 2..internal.header.current_size as usize {
                        assert!(
                            internal.key_at(i - 1) < internal.key_at(i),
                            "separators out of order in page {}",
                            page_id
                        );
                    }
                    for child_id in internal.children() {
                        queue.push_back((child_id, depth + 1));
                    }
                }
                BPlusTreePage::Leaf(leaf) => {
                    if !is_root {
                        assert!(
                            leaf.header.current_size >= leaf.min_size(),
                            "leaf page {} under minimum",
                            page_id
                        );
                    }
                    assert!(leaf.header.current_size <= leaf.header.max_size);
                    leaf_depths.push(depth);
                }
            }
        }
        assert!(
            leaf_depths.iter().all(|d| *d == leaf_depths[0]),
            "leaves at unequal depth"
        );

        // leaf-chain traversal sees exactly the expected keys, ascending
        let mut sorted: Vec<i64> = expected_keys.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        let mut it = TreeIndexIterator::new(index.clone(), ..);
        let mut seen = vec![];
        while let Some((k, _)) = it.next().unwrap() {
            seen.push(k);
        }
        let expected_encoded: Vec<Vec<u8>> = sorted.iter().map(|i| key(*i)).collect();
        assert_eq!(seen, expected_encoded, "leaf chain mismatch");
    }

    #[test]
    fn basic_insert_makes_leaf_root() {
        let (_tmp, index) = create_test_index(50, 3, 3);
        assert!(index.is_empty());
        assert!(index.insert(&key(42), rid(42)).unwrap());
        assert!(!index.is_empty());

        let root_page_id = index.get_root_page_id();
        let guard = index.buffer_pool.fetch_page_read(root_page_id).unwrap();
        let (page, _) = BPlusTreePageCodec::decode(guard.data(), default_comparator).unwrap();
        match page {
            BPlusTreePage::Leaf(leaf) => {
                assert_eq!(leaf.header.current_size, 1);
                assert_eq!(leaf.key_at(0), key(42).as_slice());
                assert_eq!(leaf.array[0].1, rid(42));
            }
            BPlusTreePage::Internal(_) => panic!("single-entry root must be a leaf"),
        }
    }

    #[test]
    fn insert_then_get() {
        let (_tmp, index) = create_test_index(50, 3, 3);
        let keys = [1i64, 2, 3, 4, 5];
        for k in keys {
            assert!(index.insert(&key(k), rid(k)).unwrap());
        }
        for k in keys {
            assert_eq!(index.get_value(&key(k)).unwrap(), Some(rid(k)), "key {}", k);
        }
        assert_eq!(index.get_value(&key(99)).unwrap(), None);
        check_tree_integrity(&index, &keys);
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let (_tmp, index) = create_test_index(50, 3, 3);
        assert!(index.insert(&key(7), rid(7)).unwrap());
        assert!(!index.insert(&key(7), rid(8)).unwrap());
        // the original mapping survives
        assert_eq!(index.get_value(&key(7)).unwrap(), Some(rid(7)));
    }

    #[test]
    fn inserting_max_size_keys_splits_exactly_once() {
        let (_tmp, index) = create_test_index(50, 4, 4);
        for k in [10i64, 20, 30, 40] {
            index.insert(&key(k), rid(k)).unwrap();
        }
        let root_guard = index
            .buffer_pool
            .fetch_page_read(index.get_root_page_id())
            .unwrap();
        let (root, _) = BPlusTreePageCodec::decode(root_guard.data(), default_comparator).unwrap();
        match root {
            BPlusTreePage::Internal(root) => assert_eq!(root.header.current_size, 2),
            BPlusTreePage::Leaf(_) => panic!("root must have split into an internal node"),
        }
    }

    #[test]
    fn split_distributes_upper_half() {
        let (_tmp, index) = create_test_index(50, 4, 4);
        for k in [10i64, 20, 30, 40, 25] {
            index.insert(&key(k), rid(k)).unwrap();
        }

        assert_eq!(index.get_value(&key(25)).unwrap(), Some(rid(25)));

        let root_guard = index
            .buffer_pool
            .fetch_page_read(index.get_root_page_id())
            .unwrap();
        let (root, _) = BPlusTreePageCodec::decode(root_guard.data(), default_comparator).unwrap();
        drop(root_guard);
        let BPlusTreePage::Internal(root) = root else {
            panic!("expected internal root");
        };
        assert_eq!(root.header.current_size, 2);
        assert_eq!(root.key_at(1), key(30).as_slice(), "separator must be 30");

        let left_guard = index.buffer_pool.fetch_page_read(root.value_at(0)).unwrap();
        let (left, _) = BPlusTreePageCodec::decode(left_guard.data(), default_comparator).unwrap();
        let BPlusTreePage::Leaf(left) = left else {
            panic!("expected leaf");
        };
        let left_keys: Vec<&[u8]> = left.array.iter().map(|kv| kv.0.as_slice()).collect();
        assert_eq!(left_keys, vec![key(10), key(20), key(25)]);

        check_tree_integrity(&index, &[10, 20, 25, 30, 40]);
    }

    #[test]
    fn delete_borrows_from_left_sibling() {
        let (_tmp, index) = create_test_index(50, 4, 4);
        // leaves settle as [0,1,2] | [3,4,5] with separator 3
        for k in [1i64, 2, 3, 4, 0, 5] {
            index.insert(&key(k), rid(k)).unwrap();
        }
        index.remove(&key(5)).unwrap();
        index.remove(&key(4)).unwrap();

        // right leaf fell to one entry; the left leaf lends its last key
        let root_guard = index
            .buffer_pool
            .fetch_page_read(index.get_root_page_id())
            .unwrap();
        let (root, _) = BPlusTreePageCodec::decode(root_guard.data(), default_comparator).unwrap();
        drop(root_guard);
        let BPlusTreePage::Internal(root) = root else {
            panic!("expected internal root");
        };
        assert_eq!(root.key_at(1), key(2).as_slice(), "separator follows the moved key");

        check_tree_integrity(&index, &[0, 1, 2, 3]);
        for k in [0i64, 1, 2, 3] {
            assert_eq!(index.get_value(&key(k)).unwrap(), Some(rid(k)));
        }
    }

    #[test]
    fn delete_borrows_from_right_sibling() {
        let (_tmp, index) = create_test_index(50, 4, 4);
        // leaves settle as [1,2] | [3,4,5]
        for k in [1i64, 2, 3, 4, 5] {
            index.insert(&key(k), rid(k)).unwrap();
        }
        index.remove(&key(1)).unwrap();

        let root_guard = index
            .buffer_pool
            .fetch_page_read(index.get_root_page_id())
            .unwrap();
        let (root, _) = BPlusTreePageCodec::decode(root_guard.data(), default_comparator).unwrap();
        drop(root_guard);
        let BPlusTreePage::Internal(root) = root else {
            panic!("expected internal root");
        };
        assert_eq!(root.key_at(1), key(4).as_slice());

        check_tree_integrity(&index, &[2, 3, 4, 5]);
    }

    #[test]
    fn merge_collapses_root() {
        let (_tmp, index) = create_test_index(50, 4, 4);
        for k in [1i64, 2, 3, 4] {
            index.insert(&key(k), rid(k)).unwrap();
        }
        // leaves are [1,2] | [3,4]; neither can lend after this delete
        index.remove(&key(4)).unwrap();

        let root_guard = index
            .buffer_pool
            .fetch_page_read(index.get_root_page_id())
            .unwrap();
        let (root, _) = BPlusTreePageCodec::decode(root_guard.data(), default_comparator).unwrap();
        assert!(
            matches!(root, BPlusTreePage::Leaf(_)),
            "merged tree must shrink back to a leaf root"
        );
        drop(root_guard);
        check_tree_integrity(&index, &[1, 2, 3]);
    }

    #[test]
    fn delete_last_key_empties_tree() {
        let (_tmp, index) = create_test_index(50, 3, 3);
        index.insert(&key(1), rid(1)).unwrap();
        index.remove(&key(1)).unwrap();
        assert!(index.is_empty());
        assert_eq!(index.get_root_page_id(), INVALID_PAGE_ID);
        assert_eq!(index.get_value(&key(1)).unwrap(), None);

        // the tree grows again after a reset
        index.insert(&key(2), rid(2)).unwrap();
        assert_eq!(index.get_value(&key(2)).unwrap(), Some(rid(2)));
    }

    #[test]
    fn insert_then_delete_everything_round_trips() {
        let (_tmp, index) = create_test_index(100, 3, 4);
        let keys: Vec<i64> = (1..=60).collect();
        for k in &keys {
            index.insert(&key(*k), rid(*k)).unwrap();
        }
        check_tree_integrity(&index, &keys);

        // forward order
        for k in &keys {
            index.remove(&key(*k)).unwrap();
        }
        assert!(index.is_empty());
        assert_eq!(index.get_root_page_id(), INVALID_PAGE_ID);

        // again in reverse order
        for k in &keys {
            index.insert(&key(*k), rid(*k)).unwrap();
        }
        for k in keys.iter().rev() {
            index.remove(&key(*k)).unwrap();
        }
        assert!(index.is_empty());
    }

    #[test]
    fn sequential_edge_mix() {
        for leaf_max_size in 2..=5u32 {
            let (_tmp, index) = create_test_index(50, leaf_max_size, 4);

            let keys = [1i64, 5, 15, 20, 25, 2, -1, -2, 6, 14, 4];
            let mut present: Vec<i64> = vec![];
            for k in keys {
                index.insert(&key(k), rid(k)).unwrap();
                present.push(k);
                check_tree_integrity(&index, &present);
            }

            index.remove(&key(1)).unwrap();
            present.retain(|k| *k != 1);
            check_tree_integrity(&index, &present);

            index.insert(&key(3), rid(3)).unwrap();
            present.push(3);
            check_tree_integrity(&index, &present);

            for k in [4i64, 14, 6, 2, 15, -2, -1, 3, 5, 25, 20] {
                index.remove(&key(k)).unwrap();
                present.retain(|x| *x != k);
                check_tree_integrity(&index, &present);
            }
            assert!(index.is_empty());
        }
    }

    #[test]
    fn removing_absent_key_is_noop() {
        let (_tmp, index) = create_test_index(50, 3, 3);
        index.remove(&key(9)).unwrap();
        index.insert(&key(1), rid(1)).unwrap();
        index.remove(&key(9)).unwrap();
        assert_eq!(index.get_value(&key(1)).unwrap(), Some(rid(1)));
    }

    #[test]
    fn iterator_scans_in_order() {
        let (_tmp, index) = create_test_index(100, 3, 4);
        let keys = [9i64, 3, 27, 1, 81, 243, 6, 18];
        for k in keys {
            index.insert(&key(k), rid(k)).unwrap();
        }

        let mut it = index.begin();
        let mut seen = vec![];
        while let Some((k, r)) = it.next().unwrap() {
            seen.push((k, r));
        }
        let mut sorted = keys.to_vec();
        sorted.sort_unstable();
        assert_eq!(
            seen,
            sorted.iter().map(|k| (key(*k), rid(*k))).collect::<Vec<_>>()
        );
    }

    #[test]
    fn iterator_honors_range_bounds() {
        let (_tmp, index) = create_test_index(100, 3, 4);
        for k in 1..=20i64 {
            index.insert(&key(k), rid(k)).unwrap();
        }

        // begin_from positions at the first key >= the probe
        let mut it = index.begin_from(&key(7));
        assert_eq!(it.next().unwrap(), Some((key(7), rid(7))));
        assert_eq!(it.next().unwrap(), Some((key(8), rid(8))));

        // half-open range
        let mut it = index.iter(key(5)..key(9));
        let mut seen = vec![];
        while let Some((k, _)) = it.next().unwrap() {
            seen.push(k);
        }
        assert_eq!(seen, vec![key(5), key(6), key(7), key(8)]);

        // probe between keys
        let (_tmp2, sparse) = create_test_index(50, 3, 3);
        for k in [10i64, 20, 30] {
            sparse.insert(&key(k), rid(k)).unwrap();
        }
        let mut it = sparse.begin_from(&key(15));
        assert_eq!(it.next().unwrap(), Some((key(20), rid(20))));
    }

    #[test]
    fn iterator_on_empty_tree() {
        let (_tmp, index) = create_test_index(50, 3, 3);
        let mut it = index.begin();
        assert_eq!(it.next().unwrap(), None);
    }

    #[test]
    fn flush_then_reopen_preserves_entries() {
        let temp_dir = TempDir::new().unwrap();
        let db_file = temp_dir.path().join("test.db");
        let keys: Vec<i64> = (1..=40).collect();
        {
            let disk_manager = Arc::new(DiskManager::try_new(&db_file).unwrap());
            let disk_scheduler = Arc::new(DiskScheduler::new(disk_manager));
            let buffer_pool = Arc::new(BufferPoolManager::new(64, disk_scheduler));
            let index = BPlusTreeIndex::new(
                "orders_pk",
                buffer_pool.clone(),
                default_comparator,
                3,
                4,
            )
            .unwrap();
            for k in &keys {
                index.insert(&key(*k), rid(*k)).unwrap();
            }
            buffer_pool.flush_all_pages().unwrap();
        }

        let disk_manager = Arc::new(DiskManager::try_new(&db_file).unwrap());
        let disk_scheduler = Arc::new(DiskScheduler::new(disk_manager));
        let buffer_pool = Arc::new(BufferPoolManager::new(64, disk_scheduler));
        let reopened = Arc::new(
            BPlusTreeIndex::new("orders_pk", buffer_pool, default_comparator, 3, 4).unwrap(),
        );
        assert!(!reopened.is_empty());
        for k in &keys {
            assert_eq!(
                reopened.get_value(&key(*k)).unwrap(),
                Some(rid(*k)),
                "key {} lost across restart",
                k
            );
        }
        check_tree_integrity(&reopened, &keys);
    }

    #[test]
    fn small_pool_forces_eviction_during_growth() {
        // the working set exceeds the pool, so tree pages cycle through disk
        let (_tmp, index) = create_test_index(16, 3, 3);
        let keys: Vec<i64> = (1..=120).collect();
        for k in &keys {
            index.insert(&key(*k), rid(*k)).unwrap();
        }
        for k in &keys {
            assert_eq!(index.get_value(&key(*k)).unwrap(), Some(rid(*k)));
        }
        check_tree_integrity(&index, &keys);
    }

    #[test]
    fn concurrent_inserts_preserve_all_keys() {
        const THREADS: i64 = 4;
        const PER_THREAD: i64 = 80;
        let (_tmp, index) = create_test_index(256, 5, 5);

        let mut handles = vec![];
        for t in 0..THREADS {
            let index = index.clone();
            handles.push(thread::spawn(move || {
                for i in 0..PER_THREAD {
                    let k = t * PER_THREAD + i;
                    assert!(index.insert(&key(k), rid(k)).unwrap());
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let all: Vec<i64> = (0..THREADS * PER_THREAD).collect();
        for k in &all {
            assert_eq!(index.get_value(&key(*k)).unwrap(), Some(rid(*k)));
        }
        check_tree_integrity(&index, &all);
    }

    #[test]
    fn concurrent_readers_during_inserts() {
        const WRITERS: i64 = 2;
        const PER_WRITER: i64 = 60;
        let (_tmp, index) = create_test_index(256, 5, 5);

        // a stable prefix readers can always expect
        for k in 0..20i64 {
            index.insert(&key(k), rid(k)).unwrap();
        }

        let mut handles = vec![];
        for t in 0..WRITERS {
            let index = index.clone();
            handles.push(thread::spawn(move || {
                for i in 0..PER_WRITER {
                    let k = 100 + t * PER_WRITER + i;
                    index.insert(&key(k), rid(k)).unwrap();
                }
            }));
        }
        for _ in 0..2 {
            let index = index.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..30 {
                    for k in 0..20i64 {
                        assert_eq!(index.get_value(&key(k)).unwrap(), Some(rid(k)));
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let mut all: Vec<i64> = (0..20).collect();
        all.extend(100..100 + WRITERS * PER_WRITER);
        check_tree_integrity(&index, &all);
    }

    #[test]
    fn concurrent_deletes_drain_the_tree() {
        const THREADS: i64 = 4;
        const PER_THREAD: i64 = 50;
        let (_tmp, index) = create_test_index(256, 4, 4);
        let all: Vec<i64> = (0..THREADS * PER_THREAD).collect();
        for k in &all {
            index.insert(&key(*k), rid(*k)).unwrap();
        }

        let mut handles = vec![];
        for t in 0..THREADS {
            let index = index.clone();
            handles.push(thread::spawn(move || {
                for i in 0..PER_THREAD {
                    index.remove(&key(t * PER_THREAD + i)).unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(index.is_empty());
        assert_eq!(index.get_root_page_id(), INVALID_PAGE_ID);
    }

    #[test]
    fn randomized_workload_keeps_invariants() {
        use rand::rngs::StdRng;
        use rand::seq::SliceRandom;
        use rand::{Rng, SeedableRng};

        let mut rng = StdRng::seed_from_u64(0x5eed);
        for _ in 0..3 {
            let leaf_max = rng.gen_range(2..=6);
            let internal_max = rng.gen_range(3..=6);
            let (_tmp, index) = create_test_index(128, leaf_max, internal_max);

            let mut keys: Vec<i64> = (-100..100).collect();
            keys.shuffle(&mut rng);
            for k in &keys {
                index.insert(&key(*k), rid(*k)).unwrap();
            }
            check_tree_integrity(&index, &keys);

            keys.shuffle(&mut rng);
            let (to_delete, to_keep) = keys.split_at(keys.len() / 2);
            for k in to_delete {
                index.remove(&key(*k)).unwrap();
            }
            check_tree_integrity(&index, to_keep);
            for k in to_delete {
                assert_eq!(index.get_value(&key(*k)).unwrap(), None);
            }
            for k in to_keep {
                assert_eq!(index.get_value(&key(*k)).unwrap(), Some(rid(*k)));
            }
        }
    }

    #[test]
    fn to_dot_renders_without_panicking() {
        let (_tmp, index) = create_test_index(50, 3, 3);
        assert!(index.to_dot().unwrap().contains("empty tree"));
        for k in 1..=10i64 {
            index.insert(&key(k), rid(k)).unwrap();
        }
        let dot = index.to_dot().unwrap();
        assert!(dot.starts_with("digraph"));
    }
}

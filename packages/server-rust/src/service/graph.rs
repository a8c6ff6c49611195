//! Dependency ordering of a change-set batch.
//!
//! Rows are addressed by [`RowRef`] (collection index, row index) into the
//! request they were built from, so the graph never borrows the request and
//! can be stored in the per-batch property bag.
//!
//! Collections are ordered with Kahn's algorithm over the association graph:
//! a collection comes after every collection that is a transitive parent of
//! it. Ready collections are taken in name order, which makes the result
//! deterministic for unrelated collections. A cycle is broken by taking the
//! smallest remaining name. Self-associations order rows inside their own
//! collection the same way, with arrival order as the tie-break.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use rowsync_core::messages::{ChangeSetRequest, ChangeType};
use rowsync_core::metadata::{Association, DbSetInfo, ServiceMetadata};
use tracing::debug;

/// Position of one row inside a [`ChangeSetRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RowRef {
    pub set_idx: usize,
    pub row_idx: usize,
}

/// Resolved edge from a child row to its parent row.
#[derive(Debug, Clone)]
pub struct ParentChildNode {
    pub association: Arc<Association>,
    pub parent: RowRef,
    pub child: RowRef,
}

/// Malformed batch shape. Always fatal to the whole batch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("unknown DbSet '{0}'")]
    UnknownDbSet(String),
    #[error("DbSet '{0}' appears more than once in the batch")]
    DuplicateDbSet(String),
    #[error("duplicate client key '{client_key}' in DbSet '{db_set}'")]
    DuplicateRow { db_set: String, client_key: String },
    #[error("unknown association '{0}'")]
    UnknownAssociation(String),
    #[error("association '{assoc}' references unknown row '{client_key}' of DbSet '{db_set}'")]
    UnknownRow {
        assoc: String,
        db_set: String,
        client_key: String,
    },
}

/// Ordered view of a batch.
#[derive(Debug)]
pub struct ChangeSetGraph {
    db_sets: Vec<Arc<DbSetInfo>>,
    collection_order: Vec<usize>,
    insert_list: Vec<RowRef>,
    update_list: Vec<RowRef>,
    delete_list: Vec<RowRef>,
    all_list: Vec<RowRef>,
    untyped: Vec<RowRef>,
    nodes: Vec<ParentChildNode>,
    parents: HashMap<RowRef, Vec<usize>>,
    children: HashMap<RowRef, Vec<usize>>,
}

impl ChangeSetGraph {
    /// Resolves rows and association hints and computes the execution order.
    ///
    /// # Errors
    ///
    /// Returns a [`GraphError`] for unknown collections or associations,
    /// duplicate client keys and hints naming rows that are not in the batch.
    pub fn build(metadata: &ServiceMetadata, request: &ChangeSetRequest) -> Result<Self, GraphError> {
        let mut db_sets = Vec::with_capacity(request.db_sets.len());
        let mut set_index: HashMap<&str, usize> = HashMap::new();
        let mut lookup: HashMap<(&str, &str), RowRef> = HashMap::new();

        for (set_idx, changes) in request.db_sets.iter().enumerate() {
            let name = changes.db_set_name.as_str();
            let info = metadata
                .db_set(name)
                .ok_or_else(|| GraphError::UnknownDbSet(name.to_string()))?;
            if set_index.insert(name, set_idx).is_some() {
                return Err(GraphError::DuplicateDbSet(name.to_string()));
            }
            db_sets.push(Arc::clone(info));
            for (row_idx, row) in changes.rows.iter().enumerate() {
                let key = (name, row.client_key.as_str());
                if lookup.insert(key, RowRef { set_idx, row_idx }).is_some() {
                    return Err(GraphError::DuplicateRow {
                        db_set: name.to_string(),
                        client_key: row.client_key.clone(),
                    });
                }
            }
        }

        let mut nodes = Vec::with_capacity(request.track_assocs.len());
        let mut parents: HashMap<RowRef, Vec<usize>> = HashMap::new();
        let mut children: HashMap<RowRef, Vec<usize>> = HashMap::new();
        for hint in &request.track_assocs {
            let association = metadata
                .association(&hint.assoc_name)
                .ok_or_else(|| GraphError::UnknownAssociation(hint.assoc_name.clone()))?;
            let resolve = |db_set: &str, client_key: &str| {
                lookup
                    .get(&(db_set, client_key))
                    .copied()
                    .ok_or_else(|| GraphError::UnknownRow {
                        assoc: hint.assoc_name.clone(),
                        db_set: db_set.to_string(),
                        client_key: client_key.to_string(),
                    })
            };
            let parent = resolve(&association.parent_db_set, &hint.parent_key)?;
            let child = resolve(&association.child_db_set, &hint.child_key)?;
            let idx = nodes.len();
            nodes.push(ParentChildNode {
                association: Arc::clone(association),
                parent,
                child,
            });
            parents.entry(child).or_default().push(idx);
            children.entry(parent).or_default().push(idx);
        }

        let set_names: Vec<&str> = request
            .db_sets
            .iter()
            .map(|s| s.db_set_name.as_str())
            .collect();
        let collection_order = order_collections(metadata, &set_names);

        let mut graph = Self {
            db_sets,
            collection_order,
            insert_list: Vec::new(),
            update_list: Vec::new(),
            delete_list: Vec::new(),
            all_list: Vec::new(),
            untyped: Vec::new(),
            nodes,
            parents,
            children,
        };

        let mut deletes_rev = Vec::new();
        let mut rest = Vec::new();
        for &set_idx in &graph.collection_order {
            let rows = &request.db_sets[set_idx].rows;
            for row_idx in graph.order_rows(set_idx, rows.len()) {
                let row_ref = RowRef { set_idx, row_idx };
                match rows[row_idx].change_type {
                    ChangeType::Added => {
                        graph.insert_list.push(row_ref);
                        rest.push(row_ref);
                    }
                    ChangeType::Updated => {
                        graph.update_list.push(row_ref);
                        rest.push(row_ref);
                    }
                    ChangeType::Deleted => deletes_rev.insert(0, row_ref),
                    ChangeType::None => graph.untyped.push(row_ref),
                }
            }
        }
        graph.delete_list.clone_from(&deletes_rev);
        deletes_rev.extend(rest);
        graph.all_list = deletes_rev;

        debug!(
            inserts = graph.insert_list.len(),
            updates = graph.update_list.len(),
            deletes = graph.delete_list.len(),
            links = graph.nodes.len(),
            "change-set graph built"
        );
        Ok(graph)
    }

    /// Row order inside one collection: parents linked through a
    /// self-association come first, arrival order otherwise.
    fn order_rows(&self, set_idx: usize, len: usize) -> Vec<usize> {
        let mut indegree = vec![0_usize; len];
        let mut edges: Vec<Vec<usize>> = vec![Vec::new(); len];
        for node in &self.nodes {
            if node.parent.set_idx == set_idx
                && node.child.set_idx == set_idx
                && node.parent.row_idx != node.child.row_idx
            {
                edges[node.parent.row_idx].push(node.child.row_idx);
                indegree[node.child.row_idx] += 1;
            }
        }
        let rank: Vec<usize> = (0..len).collect();
        kahn(&edges, &mut indegree, &rank)
    }

    #[must_use]
    pub fn insert_list(&self) -> &[RowRef] {
        &self.insert_list
    }

    #[must_use]
    pub fn update_list(&self) -> &[RowRef] {
        &self.update_list
    }

    /// Deletes, children before parents.
    #[must_use]
    pub fn delete_list(&self) -> &[RowRef] {
        &self.delete_list
    }

    /// Deletes first (children before parents), then inserts and updates in
    /// dependency order.
    #[must_use]
    pub fn all_list(&self) -> &[RowRef] {
        &self.all_list
    }

    /// Rows whose change type is [`ChangeType::None`].
    #[must_use]
    pub fn untyped_rows(&self) -> &[RowRef] {
        &self.untyped
    }

    /// Collection indices in execution order.
    #[must_use]
    pub fn collection_order(&self) -> &[usize] {
        &self.collection_order
    }

    #[must_use]
    pub fn db_set(&self, set_idx: usize) -> &Arc<DbSetInfo> {
        &self.db_sets[set_idx]
    }

    /// Links in which `row` is the child.
    pub fn parents(&self, row: RowRef) -> impl Iterator<Item = &ParentChildNode> {
        self.parents
            .get(&row)
            .into_iter()
            .flatten()
            .map(|&idx| &self.nodes[idx])
    }

    /// Links in which `row` is the parent.
    pub fn children(&self, row: RowRef) -> impl Iterator<Item = &ParentChildNode> {
        self.children
            .get(&row)
            .into_iter()
            .flatten()
            .map(|&idx| &self.nodes[idx])
    }
}

/// Orders batch collections so every transitive parent comes first.
fn order_collections(metadata: &ServiceMetadata, names: &[&str]) -> Vec<usize> {
    let mut memo: HashMap<String, Arc<HashSet<String>>> = HashMap::new();
    let ancestors: Vec<Arc<HashSet<String>>> = names
        .iter()
        .map(|name| ancestor_set(metadata, name, &mut memo, &mut HashSet::new()))
        .collect();

    let len = names.len();
    let mut indegree = vec![0_usize; len];
    let mut edges: Vec<Vec<usize>> = vec![Vec::new(); len];
    for (child, set) in ancestors.iter().enumerate() {
        for (parent, name) in names.iter().enumerate() {
            if parent != child && set.contains(*name) {
                edges[parent].push(child);
                indegree[child] += 1;
            }
        }
    }
    let mut by_name: Vec<usize> = (0..len).collect();
    by_name.sort_by_key(|&i| names[i]);
    let mut rank = vec![0_usize; len];
    for (position, &i) in by_name.iter().enumerate() {
        rank[i] = position;
    }
    kahn(&edges, &mut indegree, &rank)
}

/// Transitive parents of `name`, excluding itself. Memoized per collection.
fn ancestor_set(
    metadata: &ServiceMetadata,
    name: &str,
    memo: &mut HashMap<String, Arc<HashSet<String>>>,
    visiting: &mut HashSet<String>,
) -> Arc<HashSet<String>> {
    if let Some(found) = memo.get(name) {
        return Arc::clone(found);
    }
    if !visiting.insert(name.to_string()) {
        return Arc::new(HashSet::new());
    }
    let mut set = HashSet::new();
    for assoc in metadata.parent_associations(name) {
        if assoc.parent_db_set == name {
            continue;
        }
        set.insert(assoc.parent_db_set.clone());
        set.extend(
            ancestor_set(metadata, &assoc.parent_db_set, memo, visiting)
                .iter()
                .cloned(),
        );
    }
    set.remove(name);
    visiting.remove(name);
    let set = Arc::new(set);
    memo.insert(name.to_string(), Arc::clone(&set));
    set
}

/// Kahn's topological sort over nodes `0..rank.len()`. Among ready nodes
/// the lowest `rank` goes first; when nothing is ready (a cycle) the lowest
/// ranked remaining node is released.
fn kahn(edges: &[Vec<usize>], indegree: &mut [usize], rank: &[usize]) -> Vec<usize> {
    let len = rank.len();
    let (mut ready, mut waiting): (BTreeSet<(usize, usize)>, BTreeSet<(usize, usize)>) =
        (0..len).map(|i| (rank[i], i)).partition(|&(_, i)| indegree[i] == 0);
    let mut order = Vec::with_capacity(len);
    while let Some((_, next)) = ready.pop_first().or_else(|| waiting.pop_first()) {
        order.push(next);
        for &child in &edges[next] {
            if indegree[child] == 0 {
                continue;
            }
            indegree[child] -= 1;
            if indegree[child] == 0 && waiting.remove(&(rank[child], child)) {
                ready.insert((rank[child], child));
            }
        }
    }
    order
}

/// Collection names touched by a batch, in a deterministic order. Used for
/// logging only.
#[must_use]
pub fn batch_collections(request: &ChangeSetRequest) -> BTreeSet<&str> {
    request
        .db_sets
        .iter()
        .map(|s| s.db_set_name.as_str())
        .collect()
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use rowsync_core::messages::{DbSetChanges, RowInfo, TrackAssoc};
    use rowsync_core::metadata::{DataType, Field};

    use super::*;

    fn metadata() -> ServiceMetadata {
        let set = |name: &str| {
            DbSetInfo::new(name, name)
                .field(Field::new("Id", DataType::Integer).primary_key(1))
                .field(Field::new("ParentId", DataType::Integer))
        };
        ServiceMetadata::builder()
            .db_set(set("Customer"))
            .db_set(set("CustomerAddress"))
            .db_set(set("Order"))
            .db_set(set("OrderLine"))
            .db_set(set("Note"))
            .db_set(set("Category"))
            .association(Association::new("CustomerAddresses", "Customer", "CustomerAddress").rel("Id", "ParentId"))
            .association(Association::new("CustomerOrders", "Customer", "Order").rel("Id", "ParentId"))
            .association(Association::new("OrderLines", "Order", "OrderLine").rel("Id", "ParentId"))
            .association(Association::new("CategoryTree", "Category", "Category").rel("Id", "ParentId"))
            .build()
            .unwrap()
    }

    fn rows(name: &str, rows: &[(ChangeType, &str)]) -> DbSetChanges {
        DbSetChanges {
            db_set_name: name.to_string(),
            rows: rows.iter().map(|(ct, key)| RowInfo::new(*ct, *key)).collect(),
        }
    }

    fn hint(assoc: &str, parent: &str, child: &str) -> TrackAssoc {
        TrackAssoc {
            assoc_name: assoc.to_string(),
            parent_key: parent.to_string(),
            child_key: child.to_string(),
        }
    }

    fn names<'a>(req: &'a ChangeSetRequest, list: &[RowRef]) -> Vec<&'a str> {
        list.iter()
            .map(|r| req.db_sets[r.set_idx].rows[r.row_idx].client_key.as_str())
            .collect()
    }

    #[test]
    fn kahn_prefers_low_rank_and_breaks_cycles() {
        // 0 -> 2, 1 <-> 3
        let edges = vec![vec![2], vec![3], vec![], vec![1]];
        let mut indegree = vec![0, 1, 1, 1];
        assert_eq!(kahn(&edges, &mut indegree, &[3, 0, 1, 2]), vec![0, 2, 1, 3]);
    }

    #[test]
    fn long_self_linked_chain_orders_parents_first() {
        let len = 20_000;
        // Row i is the parent of row i - 1, so arrival order is reversed.
        let edges: Vec<Vec<usize>> = (0..len).map(|i| if i == 0 { vec![] } else { vec![i - 1] }).collect();
        let mut indegree: Vec<usize> = (0..len).map(|i| usize::from(i + 1 < len)).collect();
        let rank: Vec<usize> = (0..len).collect();
        let order = kahn(&edges, &mut indegree, &rank);
        assert_eq!(order.len(), len);
        assert!(order.iter().copied().eq((0..len).rev()));
    }

    #[test]
    fn parent_collection_inserts_first_regardless_of_arrival() {
        let req = ChangeSetRequest {
            db_sets: vec![
                rows("CustomerAddress", &[(ChangeType::Added, "a1")]),
                rows("Customer", &[(ChangeType::Added, "c1")]),
            ],
            track_assocs: vec![hint("CustomerAddresses", "c1", "a1")],
        };
        let graph = ChangeSetGraph::build(&metadata(), &req).unwrap();
        assert_eq!(names(&req, graph.insert_list()), vec!["c1", "a1"]);
        let parents: Vec<_> = graph.parents(RowRef { set_idx: 0, row_idx: 0 }).collect();
        assert_eq!(parents.len(), 1);
        assert_eq!(parents[0].parent, RowRef { set_idx: 1, row_idx: 0 });
        assert_eq!(graph.children(RowRef { set_idx: 1, row_idx: 0 }).count(), 1);
    }

    #[test]
    fn transitive_parent_orders_without_intermediate_collection() {
        let req = ChangeSetRequest {
            db_sets: vec![
                rows("OrderLine", &[(ChangeType::Added, "l1")]),
                rows("Customer", &[(ChangeType::Added, "c1")]),
            ],
            track_assocs: vec![],
        };
        let graph = ChangeSetGraph::build(&metadata(), &req).unwrap();
        assert_eq!(graph.collection_order(), &[1, 0]);
    }

    #[test]
    fn unrelated_collections_sort_by_name() {
        let req = ChangeSetRequest {
            db_sets: vec![
                rows("Note", &[(ChangeType::Added, "n")]),
                rows("Category", &[(ChangeType::Added, "c")]),
            ],
            track_assocs: vec![],
        };
        let graph = ChangeSetGraph::build(&metadata(), &req).unwrap();
        assert_eq!(graph.collection_order(), &[1, 0]);
    }

    #[test]
    fn deletes_run_children_first_and_lead_all_list() {
        let req = ChangeSetRequest {
            db_sets: vec![
                rows("Customer", &[(ChangeType::Deleted, "c1"), (ChangeType::Updated, "c2")]),
                rows("Order", &[(ChangeType::Deleted, "o1"), (ChangeType::Added, "o2")]),
            ],
            track_assocs: vec![],
        };
        let graph = ChangeSetGraph::build(&metadata(), &req).unwrap();
        assert_eq!(names(&req, graph.delete_list()), vec!["o1", "c1"]);
        assert_eq!(names(&req, graph.all_list()), vec!["o1", "c1", "c2", "o2"]);
        assert_eq!(names(&req, graph.update_list()), vec!["c2"]);
    }

    #[test]
    fn self_association_orders_rows_within_collection() {
        let req = ChangeSetRequest {
            db_sets: vec![rows(
                "Category",
                &[(ChangeType::Added, "leaf"), (ChangeType::Added, "mid"), (ChangeType::Added, "root")],
            )],
            track_assocs: vec![
                hint("CategoryTree", "root", "mid"),
                hint("CategoryTree", "mid", "leaf"),
            ],
        };
        let graph = ChangeSetGraph::build(&metadata(), &req).unwrap();
        assert_eq!(names(&req, graph.insert_list()), vec!["root", "mid", "leaf"]);
    }

    #[test]
    fn hint_with_unknown_key_is_rejected() {
        let req = ChangeSetRequest {
            db_sets: vec![rows("Customer", &[(ChangeType::Added, "c1")])],
            track_assocs: vec![hint("CustomerAddresses", "c1", "missing")],
        };
        let err = ChangeSetGraph::build(&metadata(), &req).unwrap_err();
        assert!(matches!(err, GraphError::UnknownRow { client_key, .. } if client_key == "missing"));
    }

    #[test]
    fn unknown_collection_and_duplicates_are_rejected() {
        let req = ChangeSetRequest {
            db_sets: vec![rows("Nope", &[])],
            track_assocs: vec![],
        };
        assert_eq!(
            ChangeSetGraph::build(&metadata(), &req).unwrap_err(),
            GraphError::UnknownDbSet("Nope".into())
        );

        let req = ChangeSetRequest {
            db_sets: vec![rows("Customer", &[(ChangeType::Added, "c"), (ChangeType::Added, "c")])],
            track_assocs: vec![],
        };
        assert!(matches!(
            ChangeSetGraph::build(&metadata(), &req).unwrap_err(),
            GraphError::DuplicateRow { .. }
        ));
    }

    #[test]
    fn none_change_type_is_kept_aside() {
        let req = ChangeSetRequest {
            db_sets: vec![rows("Customer", &[(ChangeType::None, "c1")])],
            track_assocs: vec![],
        };
        let graph = ChangeSetGraph::build(&metadata(), &req).unwrap();
        assert_eq!(graph.untyped_rows().len(), 1);
        assert!(graph.all_list().is_empty());
    }

    #[test]
    fn empty_batch_builds_empty_graph() {
        let graph = ChangeSetGraph::build(&metadata(), &ChangeSetRequest::default()).unwrap();
        assert!(graph.all_list().is_empty());
        assert!(batch_collections(&ChangeSetRequest::default()).is_empty());
    }

    // Random customer/order/line trees submitted in shuffled collection order
    // with one change type per tree.
    fn tree_batch() -> impl Strategy<Value = (ChangeSetRequest, bool)> {
        (1_usize..4, 0_usize..4, 0_usize..4, any::<bool>(), any::<bool>()).prop_map(
            |(customers, orders, lines, deleting, reversed)| {
                let ct = if deleting { ChangeType::Deleted } else { ChangeType::Added };
                let mut c = Vec::new();
                let mut o = Vec::new();
                let mut l = Vec::new();
                let mut hints = Vec::new();
                for ci in 0..customers {
                    let ck = format!("c{ci}");
                    for oi in 0..orders {
                        let ok = format!("{ck}o{oi}");
                        for li in 0..lines {
                            let lk = format!("{ok}l{li}");
                            hints.push(hint("OrderLines", &ok, &lk));
                            l.push(RowInfo::new(ct, lk));
                        }
                        hints.push(hint("CustomerOrders", &ck, &ok));
                        o.push(RowInfo::new(ct, ok));
                    }
                    c.push(RowInfo::new(ct, ck));
                }
                let mut db_sets = vec![
                    DbSetChanges { db_set_name: "Customer".into(), rows: c },
                    DbSetChanges { db_set_name: "Order".into(), rows: o },
                    DbSetChanges { db_set_name: "OrderLine".into(), rows: l },
                ];
                if reversed {
                    db_sets.reverse();
                }
                (ChangeSetRequest { db_sets, track_assocs: hints }, deleting)
            },
        )
    }

    proptest! {
        #[test]
        fn parents_insert_before_children_and_delete_after((req, deleting) in tree_batch()) {
            let graph = ChangeSetGraph::build(&metadata(), &req).unwrap();
            let list = if deleting { graph.delete_list() } else { graph.insert_list() };
            let pos: HashMap<RowRef, usize> = list.iter().enumerate().map(|(i, r)| (*r, i)).collect();
            for &row in list {
                for node in graph.parents(row) {
                    let (p, c) = (pos[&node.parent], pos[&node.child]);
                    if deleting {
                        prop_assert!(c < p);
                    } else {
                        prop_assert!(p < c);
                    }
                }
            }
            let total: usize = req.db_sets.iter().map(|s| s.rows.len()).sum();
            prop_assert_eq!(graph.all_list().len(), total);
        }
    }
}

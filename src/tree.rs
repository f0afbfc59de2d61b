use crate::error::TreeError;

/// Node identifiers are 1-based (class labels come in that way); the arena
/// tables subtract one to index.
pub type NodeId = usize;

/// Where a node sits under its parent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Placement {
    pub parent: NodeId,
    pub position: usize,
}

/// A parent's block of children within the flat parameter tables: one
/// parameter slot (weight row, bias entry) per child.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Family {
    pub first_slot: usize,
    pub child_count: usize,
}

/// The classifier tree, as two parallel arena tables: every node's placement
/// under its parent (the root has none), and every internal node's family of
/// children. Classes are leaves; classes and internal nodes share one id
/// space.
pub struct Topology {
    placements: Vec<Option<Placement>>,
    families: Vec<Option<Family>>,
    root: NodeId,
    longest_path: usize,
    slot_count: usize,
}

impl Topology {
    /// Wrap raw tables as supplied by the caller. Nothing is validated here:
    /// malformation surfaces as a `TreeError` from whichever walk first
    /// touches the bad entry. `longest_path` is the caller's bound on
    /// parent-chain length; walks that exceed it fail rather than loop.
    #[allow(dead_code)]
    pub fn from_tables(
        placements: Vec<Option<Placement>>,
        families: Vec<Option<Family>>,
        root: NodeId,
        longest_path: usize,
    ) -> Topology {
        let slot_count = families
            .iter()
            .flatten()
            .map(|family| family.first_slot + family.child_count)
            .max()
            .unwrap_or(0);
        Topology {
            placements,
            families,
            root,
            longest_path,
            slot_count,
        }
    }

    /// Assemble a topology from `(parent, children)` lists, assigning
    /// parameter slots in declaration order and measuring the longest
    /// parent-chain. Unlike `from_tables`, this rejects malformed input up
    /// front: every chain must reach the root.
    pub fn build(root: NodeId, families: &[(NodeId, Vec<NodeId>)]) -> Result<Topology, TreeError> {
        let mut node_count = root;
        for (parent, children) in families {
            if *parent == 0 {
                return Err(TreeError::UnknownNode(0));
            }
            node_count = node_count.max(*parent);
            for &child in children {
                if child == 0 {
                    return Err(TreeError::UnknownNode(0));
                }
                node_count = node_count.max(child);
            }
        }

        let mut placements = vec![None; node_count];
        let mut family_table = vec![None; node_count];
        let mut next_slot = 0;
        for (parent, children) in families {
            family_table[parent - 1] = Some(Family {
                first_slot: next_slot,
                child_count: children.len(),
            });
            for (position, &child) in children.iter().enumerate() {
                if placements[child - 1].is_some() {
                    return Err(TreeError::AlreadyPlaced(child));
                }
                placements[child - 1] = Some(Placement {
                    parent: *parent,
                    position,
                });
            }
            next_slot += children.len();
        }

        let mut topology = Topology {
            placements,
            families: family_table,
            root,
            longest_path: node_count,
            slot_count: next_slot,
        };
        // A chain can't be longer than the node count without a cycle, so
        // walking under that provisional bound terminates; the measured
        // maximum becomes the real bound.
        let mut longest = 0;
        for id in 1..=node_count {
            if topology.placements[id - 1].is_none() {
                continue;
            }
            let mut length = 0;
            for step in topology.walk(id) {
                step?;
                length += 1;
            }
            longest = longest.max(length);
        }
        topology.longest_path = longest;
        Ok(topology)
    }

    #[allow(dead_code)]
    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Upper bound on the number of steps in any leaf-to-root walk.
    #[allow(dead_code)]
    pub fn longest_path(&self) -> usize {
        self.longest_path
    }

    /// Total number of parameter slots (rows of the flat weight matrix).
    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    pub(crate) fn placement(&self, node: NodeId) -> Result<Placement, TreeError> {
        if node == 0 || node > self.placements.len() {
            return Err(TreeError::UnknownNode(node));
        }
        self.placements[node - 1].ok_or(TreeError::MissingParent(node))
    }

    pub(crate) fn family(&self, node: NodeId) -> Result<Family, TreeError> {
        if node == 0 || node > self.families.len() {
            return Err(TreeError::UnknownNode(node));
        }
        self.families[node - 1].ok_or(TreeError::MissingFamily(node))
    }

    /// The bottom-up walk from a class to the root: one step per ancestor
    /// family, ending with the root's own step. All three of the layer's
    /// passes traverse with this.
    pub fn walk(&self, class: NodeId) -> PathWalk<'_> {
        PathWalk {
            topology: self,
            start: class,
            cursor: Some(class),
            steps: 0,
        }
    }
}

/// One step of a leaf-to-root walk: the parent just climbed to, its family's
/// slice of the parameter tables, and which of its children we came up from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PathStep {
    pub parent: NodeId,
    pub family: Family,
    pub position: usize,
}

pub struct PathWalk<'a> {
    topology: &'a Topology,
    start: NodeId,
    cursor: Option<NodeId>,
    steps: usize,
}

impl Iterator for PathWalk<'_> {
    type Item = Result<PathStep, TreeError>;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.cursor?;
        if self.steps >= self.topology.longest_path {
            self.cursor = None;
            return Some(Err(TreeError::PathTooLong {
                class: self.start,
                limit: self.topology.longest_path,
            }));
        }
        let placement = match self.topology.placement(node) {
            Ok(placement) => placement,
            Err(error) => {
                self.cursor = None;
                return Some(Err(error));
            }
        };
        let family = match self.topology.family(placement.parent) {
            Ok(family) => family,
            Err(error) => {
                self.cursor = None;
                return Some(Err(error));
            }
        };
        if placement.position >= family.child_count {
            self.cursor = None;
            return Some(Err(TreeError::PositionOutOfFamily {
                node,
                position: placement.position,
                child_count: family.child_count,
            }));
        }
        self.steps += 1;
        self.cursor = if placement.parent == self.topology.root {
            None
        } else {
            Some(placement.parent)
        };
        Some(Ok(PathStep {
            parent: placement.parent,
            family,
            position: placement.position,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // A little two-level tree: classes 1–5, internal nodes 6 (the root), 7,
    // and 8. Slots are assigned family by family: root's children get 0–1,
    // node 7's get 2–4, node 8's get 5–6.
    //
    //         6
    //        / \
    //       7   8
    //      /|\  |\
    //     1 2 3 5 4
    fn two_level_topology() -> Topology {
        Topology::build(6, &[(6, vec![7, 8]), (7, vec![1, 2, 3]), (8, vec![5, 4])])
            .expect("tree should assemble")
    }

    #[test]
    fn test_walk_visits_ancestors_bottom_up() {
        let topology = two_level_topology();
        let steps = topology
            .walk(2)
            .collect::<Result<Vec<_>, _>>()
            .expect("walk should succeed");
        assert_eq!(steps.len(), 2);

        // First the immediate parent (node 7, slots 2..5, position 1)...
        assert_eq!(steps[0].parent, 7);
        assert_eq!(steps[0].family.first_slot, 2);
        assert_eq!(steps[0].family.child_count, 3);
        assert_eq!(steps[0].position, 1);

        // ...then the root (slots 0..2; node 7 is its 0th child).
        assert_eq!(steps[1].parent, 6);
        assert_eq!(steps[1].family.first_slot, 0);
        assert_eq!(steps[1].family.child_count, 2);
        assert_eq!(steps[1].position, 0);
    }

    #[test]
    fn test_walk_from_root_child_is_one_step() {
        let topology = two_level_topology();
        let steps = topology
            .walk(7)
            .collect::<Result<Vec<_>, _>>()
            .expect("walk should succeed");
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].parent, 6);
    }

    #[test]
    fn test_build_measures_longest_path() {
        let topology = two_level_topology();
        assert_eq!(topology.longest_path(), 2);
        assert_eq!(topology.slot_count(), 7);
    }

    #[test]
    fn test_missing_parent_is_an_error() {
        // Node 3's placement entry is absent: walking from it must report
        // the malformed tree rather than crash or wander.
        let placements = vec![
            Some(Placement {
                parent: 4,
                position: 0,
            }),
            Some(Placement {
                parent: 4,
                position: 1,
            }),
            None,
        ];
        let families = vec![
            None,
            None,
            None,
            Some(Family {
                first_slot: 0,
                child_count: 3,
            }),
        ];
        let topology = Topology::from_tables(placements, families, 4, 3);
        let result = topology.walk(3).collect::<Result<Vec<_>, _>>();
        assert_eq!(result, Err(TreeError::MissingParent(3)));
    }

    #[test]
    fn test_cycle_is_caught_by_the_path_bound() {
        // 1 and 2 claim each other as parent; no chain reaches the root.
        let placements = vec![
            Some(Placement {
                parent: 2,
                position: 0,
            }),
            Some(Placement {
                parent: 1,
                position: 0,
            }),
        ];
        let families = vec![
            Some(Family {
                first_slot: 0,
                child_count: 1,
            }),
            Some(Family {
                first_slot: 1,
                child_count: 1,
            }),
        ];
        let topology = Topology::from_tables(placements, families, 3, 4);
        let result = topology.walk(1).collect::<Result<Vec<_>, _>>();
        assert_eq!(result, Err(TreeError::PathTooLong { class: 1, limit: 4 }));
    }

    #[test]
    fn test_unknown_class_is_an_error() {
        let topology = two_level_topology();
        assert_eq!(
            topology.walk(9).collect::<Result<Vec<_>, _>>(),
            Err(TreeError::UnknownNode(9))
        );
        assert_eq!(
            topology.walk(0).collect::<Result<Vec<_>, _>>(),
            Err(TreeError::UnknownNode(0))
        );
    }

    #[test]
    fn test_build_rejects_a_node_with_two_parents() {
        let result = Topology::build(3, &[(3, vec![1, 2]), (2, vec![1])]);
        assert!(matches!(result, Err(TreeError::AlreadyPlaced(1))));
    }
}

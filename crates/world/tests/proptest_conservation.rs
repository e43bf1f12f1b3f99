//! Property-based tests for slot mechanics
//!
//! Validates the stash invariants:
//! - Non-producer actions never change per-item totals across the touched
//!   locations and every active cursor
//! - No stack ever exceeds its capacity or breaks the empty-stack invariant
//! - A split followed by a re-merge restores the original stack

use mdstash_core::{ActionKind, ContainerKey, ItemCatalog, ItemId, SessionId, Stack, StaticCatalog};
use mdstash_world::{Container, Inventory, ProducerGrant, CONTAINER_SLOT_COUNT, INVENTORY_SIZE};
use proptest::prelude::*;
use std::collections::BTreeMap;

const KEY: ContainerKey = ContainerKey::new(4, 70, -2);
const SESSIONS: [SessionId; 2] = [SessionId(1), SessionId(2)];

fn catalog() -> StaticCatalog {
    StaticCatalog::new([(1, 64), (2, 64), (3, 16), (4, 1)])
}

#[derive(Debug, Clone)]
enum Op {
    ContainerClick {
        who: usize,
        slot: usize,
        kind: ActionKind,
        quantity: Option<u32>,
    },
    InventoryClick {
        who: usize,
        slot: usize,
        kind: ActionKind,
        quantity: Option<u32>,
    },
    Close {
        who: usize,
    },
    Reopen {
        who: usize,
    },
}

fn kind_strategy() -> impl Strategy<Value = ActionKind> {
    prop_oneof![Just(ActionKind::Primary), Just(ActionKind::Secondary)]
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        6 => (0usize..2, 0usize..CONTAINER_SLOT_COUNT + 1, kind_strategy(), prop::option::of(0u32..80))
            .prop_map(|(who, slot, kind, quantity)| Op::ContainerClick { who, slot, kind, quantity }),
        4 => (0usize..2, 0usize..INVENTORY_SIZE + 1, kind_strategy(), prop::option::of(0u32..80))
            .prop_map(|(who, slot, kind, quantity)| Op::InventoryClick { who, slot, kind, quantity }),
        1 => (0usize..2).prop_map(|who| Op::Close { who }),
        1 => (0usize..2).prop_map(|who| Op::Reopen { who }),
    ]
}

fn seed_strategy() -> impl Strategy<Value = Vec<(ItemId, u32)>> {
    prop::collection::vec((1u16..=4, 1u32..=16), 1..20)
}

struct World {
    container: Container,
    inventories: [Inventory; 2],
}

impl World {
    fn seeded(seed: &[(ItemId, u32)], catalog: &StaticCatalog) -> Self {
        let mut container = Container::new(KEY);
        let mut inventories = [Inventory::new(), Inventory::new()];
        for (i, (item_id, count)) in seed.iter().enumerate() {
            let count = (*count).min(catalog.capacity(*item_id));
            if i % 2 == 0 {
                container.force_deposit(Stack::new(*item_id, count), catalog);
            } else {
                inventories[i % 4 / 2]
                    .add_item(*item_id, count, &ProducerGrant::single(*item_id, count), catalog)
                    .unwrap();
            }
        }
        for session in SESSIONS {
            container.open(session);
        }
        Self {
            container,
            inventories,
        }
    }

    fn apply(&mut self, op: &Op, catalog: &StaticCatalog) {
        match *op {
            Op::ContainerClick {
                who,
                slot,
                kind,
                quantity,
            } => {
                let _ = self
                    .container
                    .click(SESSIONS[who], slot, kind, quantity, catalog);
            }
            Op::InventoryClick {
                who,
                slot,
                kind,
                quantity,
            } => {
                let _ = self.inventories[who].click(slot, kind, quantity, catalog);
            }
            Op::Close { who } => {
                let session = SESSIONS[who];
                if !self.container.is_viewer(session) {
                    return;
                }
                let held = self.container.take_cursor(session);
                let (leftover, _) = self.inventories[who].absorb(held, catalog).unwrap();
                self.container.force_deposit(leftover, catalog);
                self.container.close(session, catalog);
            }
            Op::Reopen { who } => {
                self.container.open(SESSIONS[who]);
            }
        }
    }

    fn stacks(&self) -> Vec<Stack> {
        let mut all: Vec<Stack> = self.container.slots().to_vec();
        all.extend_from_slice(self.container.overflow());
        all.extend(self.container.cursors().map(|(_, stack)| stack));
        for inventory in &self.inventories {
            all.extend_from_slice(inventory.slots());
            all.extend_from_slice(inventory.overflow());
            all.push(inventory.cursor());
        }
        all
    }

    fn totals(&self) -> BTreeMap<ItemId, u64> {
        let mut totals = BTreeMap::new();
        for stack in self.stacks().into_iter().filter(|s| !s.is_empty()) {
            *totals.entry(stack.item_id).or_insert(0) += u64::from(stack.count);
        }
        totals
    }
}

proptest! {
    /// Property: per-item totals across both locations and every cursor never change
    #[test]
    fn actions_conserve_items(
        seed in seed_strategy(),
        ops in prop::collection::vec(op_strategy(), 1..120),
    ) {
        let catalog = catalog();
        let mut world = World::seeded(&seed, &catalog);
        let expected = world.totals();

        for op in &ops {
            world.apply(op, &catalog);
            prop_assert_eq!(&world.totals(), &expected, "totals drifted after {:?}", op);
        }
    }

    /// Property: stacks stay within [0, capacity] and id 0 ⇔ count 0
    #[test]
    fn stacks_stay_in_bounds(
        seed in seed_strategy(),
        ops in prop::collection::vec(op_strategy(), 1..120),
    ) {
        let catalog = catalog();
        let mut world = World::seeded(&seed, &catalog);

        for op in &ops {
            world.apply(op, &catalog);
            for stack in world.container.slots().iter().chain(world.inventories.iter().flat_map(|i| i.slots().iter())) {
                prop_assert!(stack.is_canonical(), "non-canonical {:?}", stack);
                if !stack.is_empty() {
                    prop_assert!(stack.count <= catalog.capacity(stack.item_id), "over capacity {:?}", stack);
                }
            }
        }
    }

    /// Property: Secondary split then Primary re-merge restores the stack
    #[test]
    fn split_then_merge_restores_count(
        item_id in 1u16..=3,
        count in 1u32..=64,
    ) {
        let catalog = catalog();
        let count = count.min(catalog.capacity(item_id));
        let mut container = Container::new(KEY);
        container.open(SESSIONS[0]);
        container.force_deposit(Stack::new(item_id, count), &catalog);
        let origin = container.slots().iter().position(|s| !s.is_empty()).unwrap();

        container.click(SESSIONS[0], origin, ActionKind::Secondary, None, &catalog).unwrap();
        prop_assert_eq!(
            container.cursor(SESSIONS[0]).unwrap().count + container.slots()[origin].count,
            count
        );

        container.click(SESSIONS[0], origin, ActionKind::Primary, None, &catalog).unwrap();
        prop_assert_eq!(container.slots()[origin], Stack::new(item_id, count));
        prop_assert_eq!(container.cursor(SESSIONS[0]), Some(Stack::EMPTY));
    }
}

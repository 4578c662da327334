use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;

use tessera::{
    Addr, ElementType, MemPersistence, NoopEvents, Storage, StoreConfig,
};

const NUM_THREADS: usize = 8;
const OPERATIONS_PER_THREAD: usize = 50;

fn new_store() -> Arc<Storage> {
    let store = Storage::new(
        StoreConfig::default(),
        Arc::new(NoopEvents),
        Arc::new(MemPersistence::default()),
    );
    store.initialize(true).unwrap();
    Arc::new(store)
}

fn out_chain(store: &Storage, addr: Addr) -> Vec<Addr> {
    let mut chain = Vec::new();
    let mut cur = store.lock(addr).unwrap().element().first_out;
    while !cur.is_empty() {
        chain.push(cur);
        cur = store.lock(cur).unwrap().element().arc.next_out;
    }
    chain
}

fn in_chain(store: &Storage, addr: Addr) -> Vec<Addr> {
    let mut chain = Vec::new();
    let mut cur = store.lock(addr).unwrap().element().first_in;
    while !cur.is_empty() {
        chain.push(cur);
        cur = store.lock(cur).unwrap().element().arc.next_in;
    }
    chain
}

#[test]
fn concurrent_node_creation_yields_distinct_addresses() {
    let store = new_store();
    let barrier = Arc::new(Barrier::new(NUM_THREADS));
    let mut handles = Vec::new();

    for _ in 0..NUM_THREADS {
        let store = Arc::clone(&store);
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            let ctx = store.create_context();
            barrier.wait();
            let mut addrs = Vec::new();
            for _ in 0..OPERATIONS_PER_THREAD {
                addrs.push(store.create_node(&ctx, ElementType::default()).unwrap());
            }
            addrs
        }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        for addr in handle.join().unwrap() {
            assert!(seen.insert(addr.raw()), "address issued twice");
            assert!(store.is_element(addr));
        }
    }
    assert_eq!(seen.len(), NUM_THREADS * OPERATIONS_PER_THREAD);
}

#[test]
fn concurrent_arc_creation_between_same_endpoints() {
    let store = new_store();
    let setup_ctx = store.create_context();
    let a = store.create_node(&setup_ctx, ElementType::default()).unwrap();
    let b = store.create_node(&setup_ctx, ElementType::default()).unwrap();

    let barrier = Arc::new(Barrier::new(NUM_THREADS));
    let mut handles = Vec::new();
    for _ in 0..NUM_THREADS {
        let store = Arc::clone(&store);
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            let ctx = store.create_context();
            barrier.wait();
            let mut arcs = Vec::new();
            for _ in 0..OPERATIONS_PER_THREAD {
                arcs.push(store.create_arc(&ctx, ElementType::ARC, a, b).unwrap());
            }
            arcs
        }));
    }

    let mut reported = HashSet::new();
    for handle in handles {
        for arc in handle.join().unwrap() {
            assert!(reported.insert(arc.raw()), "arc address issued twice");
        }
    }
    let expected = NUM_THREADS * OPERATIONS_PER_THREAD;
    assert_eq!(reported.len(), expected);

    // Both chains contain exactly the reported arcs, each once.
    let out: Vec<u32> = out_chain(&store, a).iter().map(|x| x.raw()).collect();
    let inn: Vec<u32> = in_chain(&store, b).iter().map(|x| x.raw()).collect();
    assert_eq!(out.len(), expected);
    assert_eq!(inn.len(), expected);
    assert_eq!(out.iter().copied().collect::<HashSet<_>>(), reported);
    assert_eq!(inn.iter().copied().collect::<HashSet<_>>(), reported);

    for arc in &reported {
        let el = store.lock(Addr::from_raw(*arc)).unwrap().element();
        assert_eq!(el.arc.begin, a);
        assert_eq!(el.arc.end, b);
    }
}

#[test]
fn concurrent_free_of_disjoint_subgraphs() {
    let store = new_store();
    let setup_ctx = store.create_context();

    // One chain a -> b -> c per thread; each thread frees its middle
    // node, which must take both arcs with it and nothing else.
    let mut chains = Vec::new();
    for _ in 0..NUM_THREADS {
        let a = store.create_node(&setup_ctx, ElementType::default()).unwrap();
        let b = store.create_node(&setup_ctx, ElementType::default()).unwrap();
        let c = store.create_node(&setup_ctx, ElementType::default()).unwrap();
        let e1 = store.create_arc(&setup_ctx, ElementType::ARC, a, b).unwrap();
        let e2 = store.create_arc(&setup_ctx, ElementType::ARC, b, c).unwrap();
        chains.push((a, b, c, e1, e2));
    }

    let barrier = Arc::new(Barrier::new(NUM_THREADS));
    let mut handles = Vec::new();
    for (_, b, _, _, _) in &chains {
        let store = Arc::clone(&store);
        let barrier = Arc::clone(&barrier);
        let b = *b;
        handles.push(thread::spawn(move || {
            let ctx = store.create_context();
            barrier.wait();
            store.free(&ctx, b).unwrap();
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    for (a, b, c, e1, e2) in chains {
        assert!(!store.is_element(b));
        assert!(!store.is_element(e1));
        assert!(!store.is_element(e2));
        assert!(store.is_element(a));
        assert!(store.is_element(c));
        assert!(store.lock(a).unwrap().element().first_out.is_empty());
        assert!(store.lock(c).unwrap().element().first_in.is_empty());
    }
}

#[test]
fn concurrent_free_of_overlapping_closures() {
    // Every leaf's deletion closure contains its hub arc, and the hub's
    // closure contains all of them, so the lock sets overlap heavily;
    // every free must still run to completion.
    let store = new_store();
    let setup_ctx = store.create_context();
    let hub = store.create_node(&setup_ctx, ElementType::default()).unwrap();
    let mut leaves = Vec::new();
    for _ in 0..NUM_THREADS - 1 {
        let leaf = store.create_node(&setup_ctx, ElementType::default()).unwrap();
        store
            .create_arc(&setup_ctx, ElementType::ARC, hub, leaf)
            .unwrap();
        leaves.push(leaf);
    }

    let barrier = Arc::new(Barrier::new(NUM_THREADS));
    let mut handles = Vec::new();
    {
        let store = Arc::clone(&store);
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            let ctx = store.create_context();
            barrier.wait();
            store.free(&ctx, hub).unwrap();
        }));
    }
    for leaf in &leaves {
        let store = Arc::clone(&store);
        let barrier = Arc::clone(&barrier);
        let leaf = *leaf;
        handles.push(thread::spawn(move || {
            let ctx = store.create_context();
            barrier.wait();
            store.free(&ctx, leaf).unwrap();
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert!(!store.is_element(hub));
    for leaf in leaves {
        assert!(!store.is_element(leaf));
    }
    assert_eq!(store.elements_stat().live_count(), 0);
}

#[test]
fn concurrent_free_of_shared_arc_endpoints() {
    // Two threads race to free the two endpoints of the same arc; both
    // closures contain the arc and both endpoints, exercising the
    // sorted-acquisition rounds against each other.
    let store = new_store();
    let setup_ctx = store.create_context();
    let pairs: Vec<(Addr, Addr, Addr)> = (0..NUM_THREADS / 2)
        .map(|_| {
            let a = store.create_node(&setup_ctx, ElementType::default()).unwrap();
            let b = store.create_node(&setup_ctx, ElementType::default()).unwrap();
            let e = store.create_arc(&setup_ctx, ElementType::ARC, a, b).unwrap();
            (a, b, e)
        })
        .collect();

    let barrier = Arc::new(Barrier::new(NUM_THREADS));
    let mut handles = Vec::new();
    for (a, b, _) in &pairs {
        for target in [*a, *b] {
            let store = Arc::clone(&store);
            let barrier = Arc::clone(&barrier);
            handles.push(thread::spawn(move || {
                let ctx = store.create_context();
                barrier.wait();
                store.free(&ctx, target).unwrap();
            }));
        }
    }
    for handle in handles {
        handle.join().unwrap();
    }

    for (a, b, e) in pairs {
        assert!(!store.is_element(a));
        assert!(!store.is_element(b));
        assert!(!store.is_element(e));
    }
}

#[test]
fn concurrent_creation_and_disjoint_free() {
    // Creators fill fresh nodes while other threads free pre-built
    // disjoint stars; allocation reuses the freed slots without ever
    // handing one slot to two callers.
    let store = new_store();
    let setup_ctx = store.create_context();

    let mut hubs = Vec::new();
    for _ in 0..NUM_THREADS / 2 {
        let hub = store.create_node(&setup_ctx, ElementType::default()).unwrap();
        for _ in 0..8 {
            let leaf = store.create_node(&setup_ctx, ElementType::default()).unwrap();
            store
                .create_arc(&setup_ctx, ElementType::ARC, hub, leaf)
                .unwrap();
        }
        hubs.push(hub);
    }

    let barrier = Arc::new(Barrier::new(NUM_THREADS));
    let mut handles = Vec::new();
    for hub in &hubs {
        let store = Arc::clone(&store);
        let barrier = Arc::clone(&barrier);
        let hub = *hub;
        handles.push(thread::spawn(move || {
            let ctx = store.create_context();
            barrier.wait();
            store.free(&ctx, hub).unwrap();
            Vec::new()
        }));
    }
    for _ in hubs.len()..NUM_THREADS {
        let store = Arc::clone(&store);
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            let ctx = store.create_context();
            barrier.wait();
            let mut addrs = Vec::new();
            for _ in 0..OPERATIONS_PER_THREAD {
                addrs.push(store.create_node(&ctx, ElementType::default()).unwrap());
            }
            addrs
        }));
    }

    let mut created = HashSet::new();
    for handle in handles {
        for addr in handle.join().unwrap() {
            assert!(created.insert(addr.raw()), "address issued twice");
        }
    }
    for addr in &created {
        assert!(store.is_element(Addr::from_raw(*addr)));
    }
    // A freed hub slot may have been recycled by a creator thread; only
    // un-recycled hub addresses must read as empty.
    for hub in hubs {
        if !created.contains(&hub.raw()) {
            assert!(!store.is_element(hub));
        }
    }
}

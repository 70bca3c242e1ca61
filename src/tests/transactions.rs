use crate::{
    tests::{open_writable, with_temp_dir},
    Address, StoreError, LEADER_SIZE, TRAILER_SIZE,
};

#[test]
fn first_commit_produces_generation_one() {
    with_temp_dir(|dir| {
        let mut db = open_writable(dir);
        let base_footer = db.footer_pos();

        let payload: Vec<u8> = (1..=16).collect();
        let addr = {
            let mut tx = db.begin_transaction().expect("should begin transaction");
            assert_eq!(tx.generation(), 1);
            let addr = tx.allocate(16, 8).expect("should allocate");
            tx.write(addr, &payload).expect("should write");
            tx.commit().expect("should commit");
            addr
        };

        assert_eq!(db.current_revision(), 1);
        assert_eq!(addr.absolute() % 8, 0);

        let read = db.get(addr, 16, true).expect("should read");
        assert_eq!(&read[..], &payload[..]);

        // The new trailer links back to the revision the transaction began
        // against.
        let trailer = db.read_trailer(db.footer_pos());
        assert_eq!(trailer.generation, 1);
        assert_eq!(trailer.prev_generation, base_footer);
        assert!(trailer.crc_matches());
    });
}

#[test]
fn dropped_transaction_rolls_back() {
    with_temp_dir(|dir| {
        let mut db = open_writable(dir);
        let logical_before = db.logical_size();

        {
            let mut tx = db.begin_transaction().expect("should begin transaction");
            tx.append(&[0xaa; 100], 1).expect("should append");
            // Dropped without commit.
        }

        assert_eq!(db.current_revision(), 0);
        assert_eq!(db.logical_size(), logical_before);
    });
}

#[test]
fn explicit_rollback_discards_writes() {
    with_temp_dir(|dir| {
        let mut db = open_writable(dir);
        let logical_before = db.logical_size();

        let mut tx = db.begin_transaction().expect("should begin transaction");
        let addr = tx.append(b"discarded", 1).expect("should append");
        tx.rollback().expect("rollback should succeed");

        assert_eq!(db.logical_size(), logical_before);
        // The rolled-back address is no longer part of the revision.
        assert!(matches!(
            db.get(addr, 9, true),
            Err(StoreError::BadAddress { .. })
        ));
    });
}

#[test]
fn transactions_read_their_own_writes() {
    with_temp_dir(|dir| {
        let mut db = open_writable(dir);
        let mut tx = db.begin_transaction().expect("should begin transaction");

        let addr = tx.append(b"uncommitted", 1).expect("should append");
        let read = tx.get(addr, 11, true).expect("should read own write");
        assert_eq!(&read[..], b"uncommitted");

        let unique = tx.getu(addr, 11, true).expect("should read own write");
        assert_eq!(&unique[..], b"uncommitted");
    });
}

#[test]
fn commits_chain_and_times_are_monotonic() {
    with_temp_dir(|dir| {
        let mut db = open_writable(dir);

        for round in 1u32..=5 {
            let mut tx = db.begin_transaction().expect("should begin transaction");
            tx.append(&round.to_le_bytes(), 4).expect("should append");
            assert_eq!(tx.commit().expect("should commit"), round);
        }
        assert_eq!(db.current_revision(), 5);

        // Walk the whole chain back to generation zero, checking the
        // linked-list invariants along the way.
        let mut pos = db.footer_pos();
        let mut expected = 5u32;
        loop {
            let trailer = db.read_trailer(pos);
            assert_eq!(trailer.generation, expected);
            assert!(trailer.crc_matches());
            if expected == 0 {
                assert!(trailer.prev_generation.is_null());
                break;
            }
            let prev = trailer.prev_generation;
            assert!(prev.absolute() + TRAILER_SIZE <= pos.absolute());
            let previous = db.read_trailer(prev);
            assert!(previous.generation < trailer.generation);
            assert!(previous.time <= trailer.time);
            pos = prev;
            expected -= 1;
        }
    });
}

#[test]
fn committed_bytes_cannot_be_rewritten() {
    with_temp_dir(|dir| {
        let mut db = open_writable(dir);

        let addr = {
            let mut tx = db.begin_transaction().expect("should begin transaction");
            let addr = tx.append(b"sealed", 1).expect("should append");
            tx.commit().expect("should commit");
            addr
        };

        // The committed address now precedes the first writable address.
        assert!(addr < db.first_writable_address());
        assert!(matches!(
            db.get_mut(addr, 6, true),
            Err(StoreError::ReadOnlyAddress { .. })
        ));

        // A fresh transaction cannot reach it either.
        let mut tx = db.begin_transaction().expect("should begin transaction");
        assert!(matches!(
            tx.write(addr, b"mutate"),
            Err(StoreError::ReadOnlyAddress { .. })
        ));
    });
}

#[test]
fn index_roots_are_staged_and_carried_forward() {
    with_temp_dir(|dir| {
        let mut db = open_writable(dir);

        let root = {
            let mut tx = db.begin_transaction().expect("should begin transaction");
            let root = tx.append(b"index payload", 8).expect("should append");
            tx.set_index_root(2, root);
            tx.commit().expect("should commit");
            root
        };
        assert_eq!(db.index_root(2).expect("should read root"), root);
        assert_eq!(db.index_root(0).expect("should read root"), Address::NULL);

        // A commit that does not restage the slot carries it forward.
        {
            let mut tx = db.begin_transaction().expect("should begin transaction");
            tx.append(b"unrelated", 1).expect("should append");
            tx.commit().expect("should commit");
        }
        assert_eq!(db.index_root(2).expect("should read root"), root);

        // Syncing back to the revision before the root was set clears it.
        db.sync(crate::Revision::Generation(0)).expect("should sync");
        assert_eq!(db.index_root(2).expect("should read root"), Address::NULL);
    });
}

#[test]
fn empty_commit_still_advances_the_generation() {
    with_temp_dir(|dir| {
        let mut db = open_writable(dir);

        let tx = db.begin_transaction().expect("should begin transaction");
        tx.commit().expect("should commit");

        assert_eq!(db.current_revision(), 1);
        let trailer = db.read_trailer(db.footer_pos());
        // The new trailer sits just past the old one, 8-byte aligned.
        assert_eq!(
            db.footer_pos().absolute(),
            LEADER_SIZE + TRAILER_SIZE
        );
        assert_eq!(trailer.generation, 1);
    });
}

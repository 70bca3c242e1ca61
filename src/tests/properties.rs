use proptest::{collection::vec, proptest, test_runner::Config};

use crate::{
    tests::{open_readonly, open_writable, with_temp_dir},
    Revision, TRAILER_SIZE,
};

// Each case builds a real store on disk, so the case counts stay modest.
proptest! {
    #![proptest_config(Config::with_cases(24))]

    // Every allocation lands on the requested alignment, whatever mix of
    // sizes and alignments precedes it.
    #[test]
    fn allocations_respect_alignment(requests in vec((0u64..600, 0u32..9), 1..24)) {
        with_temp_dir(|dir| {
            let mut db = open_writable(dir);
            let mut tx = db.begin_transaction().expect("should begin transaction");
            for (bytes, align_shift) in &requests {
                let align = 1u64 << align_shift;
                let addr = tx.allocate(*bytes, align).expect("should allocate");
                assert_eq!(addr.absolute() % align, 0);
            }
        });
    }

    // Whatever was written in a committed transaction reads back
    // byte-for-byte after a reopen.
    #[test]
    fn committed_writes_round_trip(chunks in vec(vec(proptest::num::u8::ANY, 1..700), 1..12)) {
        with_temp_dir(|dir| {
            let mut written = Vec::with_capacity(chunks.len());
            {
                let mut db = open_writable(dir);
                let mut tx = db.begin_transaction().expect("should begin transaction");
                for chunk in &chunks {
                    let addr = tx.append(chunk, 2).expect("should append");
                    written.push((addr, chunk.clone()));
                }
                tx.commit().expect("should commit");
            }

            let db = open_readonly(dir);
            for (addr, expected) in &written {
                let read = db.get(*addr, expected.len(), true).expect("should read");
                assert_eq!(&read[..], &expected[..]);
            }
        });
    }

    // The revision chain obeys its invariants after any number of commits,
    // and every historical revision remains addressable.
    #[test]
    fn revision_chain_invariants_hold(commits in 1u32..8) {
        with_temp_dir(|dir| {
            let mut db = open_writable(dir);
            for round in 0..commits {
                let mut tx = db.begin_transaction().expect("should begin transaction");
                tx.append(&round.to_le_bytes(), 4).expect("should append");
                tx.commit().expect("should commit");
            }

            // Walk from head to generation zero.
            assert_eq!(db.footer_pos().absolute() + TRAILER_SIZE, db.logical_size());
            let mut pos = db.footer_pos();
            let mut generation = commits;
            loop {
                let trailer = db.read_trailer(pos);
                assert_eq!(trailer.generation, generation);
                assert!(trailer.crc_matches());
                if generation == 0 {
                    assert!(trailer.prev_generation.is_null());
                    break;
                }
                let prev = trailer.prev_generation;
                assert!(prev.absolute() < pos.absolute());
                let previous = db.read_trailer(prev);
                assert!(previous.generation < trailer.generation);
                assert!(previous.time <= trailer.time);
                pos = prev;
                generation -= 1;
            }

            // Every generation is reachable by name, twice over (syncing is
            // idempotent).
            for generation in (0..=commits).rev() {
                db.sync(Revision::Generation(generation)).expect("should sync");
                let footer = db.footer_pos();
                db.sync(Revision::Generation(generation)).expect("should sync");
                assert_eq!(db.footer_pos(), footer);
                assert_eq!(db.current_revision(), generation);
            }
        });
    }
}

use std::{fs::OpenOptions, os::unix::fs::FileExt, path::Path};

use crate::{
    tests::{open_writable, store_path, test_config, with_temp_dir},
    AccessMode, Database, Revision, StoreError,
};

/// Reads the header's footer slot straight off the disk.
fn raw_footer_pos(path: &Path) -> u64 {
    let file = OpenOptions::new()
        .read(true)
        .open(path)
        .expect("should open store file");
    let mut bytes = [0u8; 8];
    file.read_exact_at(&mut bytes, 32)
        .expect("should read footer slot");
    u64::from_le_bytes(bytes)
}

/// Flips one bit at an absolute file offset.
fn flip_bit(path: &Path, offset: u64) {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .expect("should open store file");
    let mut byte = [0u8; 1];
    file.read_exact_at(&mut byte, offset).expect("should read byte");
    byte[0] ^= 0x01;
    file.write_all_at(&byte, offset).expect("should write byte");
}

#[test]
fn damaged_head_trailer_fails_open() {
    with_temp_dir(|dir| {
        {
            let mut db = open_writable(dir);
            let mut tx = db.begin_transaction().expect("should begin transaction");
            tx.append(b"doomed", 1).expect("should append");
            tx.commit().expect("should commit");
        }

        let path = store_path(dir);
        let footer = raw_footer_pos(&path);
        // The time field sits 8 bytes into the trailer.
        flip_bit(&path, footer + 8);

        let error = Database::open_with_config(&path, AccessMode::ReadOnly, test_config())
            .expect_err("a damaged head trailer must fail validation");
        assert!(matches!(error, StoreError::FooterCorrupt { .. }));

        let error = Database::open_with_config(&path, AccessMode::Writable, test_config())
            .expect_err("writable opens must reject the damage too");
        assert!(matches!(error, StoreError::FooterCorrupt { .. }));

        // Undoing the damage makes the store whole again: nothing else was
        // mutated by the failed opens.
        flip_bit(&path, footer + 8);
        let db = Database::open_with_config(&path, AccessMode::ReadOnly, test_config())
            .expect("restored store should open");
        assert_eq!(db.current_revision(), 1);
    });
}

#[test]
fn footer_beyond_the_file_fails_open() {
    with_temp_dir(|dir| {
        drop(open_writable(dir));
        let path = store_path(dir);

        // Point the header at a trailer far past the end of the file.
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .expect("should open store file");
        file.write_all_at(&u64::MAX.to_le_bytes(), 32)
            .expect("should overwrite footer slot");
        drop(file);

        let error = Database::open_with_config(&path, AccessMode::ReadOnly, test_config())
            .expect_err("a footer beyond the file must fail");
        assert!(matches!(error, StoreError::FooterCorrupt { .. }));
    });
}

#[test]
fn mangled_magic_fails_open() {
    with_temp_dir(|dir| {
        drop(open_writable(dir));
        let path = store_path(dir);
        flip_bit(&path, 0);

        let error = Database::open_with_config(&path, AccessMode::ReadOnly, test_config())
            .expect_err("a mangled magic must fail");
        assert!(matches!(error, StoreError::HeaderCorrupt { .. }));
    });
}

#[test]
fn torn_bytes_past_the_head_are_ignored() {
    with_temp_dir(|dir| {
        let addr = {
            let mut db = open_writable(dir);
            let mut tx = db.begin_transaction().expect("should begin transaction");
            let addr = tx.append(b"survives the crash", 1).expect("should append");
            tx.commit().expect("should commit");
            addr
        };

        // Simulate a writer that died mid-append: garbage lands past the
        // committed head trailer, but the header still names the old
        // revision.
        let path = store_path(dir);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .expect("should open store file");
        let end = file.metadata().expect("should stat file").len();
        file.write_all_at(&[0xde; 300], end)
            .expect("should append garbage");
        drop(file);

        // Reopening needs no recovery phase: the previous revision is
        // simply the current one.
        let mut db = Database::open_with_config(&path, AccessMode::Writable, test_config())
            .expect("should reopen the store");
        assert_eq!(db.current_revision(), 1);
        let read = db.get(addr, 18, true).expect("should read");
        assert_eq!(&read[..], b"survives the crash");

        // And the next commit happily claims the space the garbage sits in.
        let mut tx = db.begin_transaction().expect("should begin transaction");
        let next = tx.append(b"after the crash", 1).expect("should append");
        tx.commit().expect("should commit");
        let read = db.get(next, 15, true).expect("should read");
        assert_eq!(&read[..], b"after the crash");
    });
}

#[test]
fn corrupt_link_in_the_chain_fails_the_walk_but_not_the_head() {
    with_temp_dir(|dir| {
        let mut db = open_writable(dir);
        for payload in [&b"one"[..], b"two", b"three"] {
            let mut tx = db.begin_transaction().expect("should begin transaction");
            tx.append(payload, 1).expect("should append");
            tx.commit().expect("should commit");
        }

        // Find the generation-1 trailer by walking the intact chain.
        let head = db.footer_pos();
        let gen2 = db.read_trailer(head).prev_generation;
        let gen1 = db.read_trailer(gen2).prev_generation;
        drop(db);

        let path = store_path(dir);
        // Damage the generation-1 trailer's checksum field.
        flip_bit(&path, gen1.absolute() + 56);

        // The head (and its immediate predecessor) still validate, so the
        // store opens and serves the newest revision.
        let mut db = Database::open_with_config(&path, AccessMode::ReadOnly, test_config())
            .expect("head revision should still open");
        assert_eq!(db.current_revision(), 3);

        // Walking back through the damaged link fails and leaves the view
        // unchanged.
        let error = db
            .sync(Revision::Generation(0))
            .expect_err("the walk must trip over the damaged trailer");
        assert!(matches!(error, StoreError::FooterCorrupt { .. }));
        assert_eq!(db.current_revision(), 3);
        assert_eq!(db.footer_pos(), head);

        // Revision 2 sits before the damage and is still reachable.
        db.sync(Revision::Generation(2)).expect("should sync to 2");
        assert_eq!(db.current_revision(), 2);
    });
}

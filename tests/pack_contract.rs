use std::collections::{HashMap, HashSet};
use std::hash::Hasher;
use std::io::Read;
use std::path::Path;

use ftldat::{open_pack, DatPack, FolderPack, OpenMode, Pack, PackError, PackOptions, PkgPack};
use tempfile::tempdir;
use twox_hash::XxHash64;

fn small_options() -> PackOptions {
    PackOptions {
        initial_index_size: 4,
        index_growth: 3,
        path_bytes_per_slot: 16,
        chunk_size: 128,
        compress_new_additions: false,
    }
}

fn create_packs(dir: &Path) -> Vec<Box<dyn Pack>> {
    let compressed = PackOptions {
        compress_new_additions: true,
        ..small_options()
    };
    let dat = DatPack::open_with_options(dir.join("data.dat"), OpenMode::Create, small_options());
    let plain = PkgPack::open_with_options(dir.join("plain.pkg"), OpenMode::Create, small_options());
    let packed = PkgPack::open_with_options(dir.join("packed.pkg"), OpenMode::Create, compressed);
    let folder = FolderPack::open(dir.join("folder"), OpenMode::Create);
    vec![
        Box::new(dat.unwrap()),
        Box::new(plain.unwrap()),
        Box::new(packed.unwrap()),
        Box::new(folder.unwrap()),
    ]
}

fn payload(seed: usize) -> Vec<u8> {
    let size = (seed * 7919) % 20_000;
    (0..size).map(|i| ((i * 31 + seed) % 251) as u8).collect()
}

fn fingerprint(content: &[u8]) -> u64 {
    let mut hasher = XxHash64::default();
    hasher.write(content);
    hasher.finish()
}

fn fingerprints(pack: &dyn Pack) -> HashMap<String, u64> {
    pack.list()
        .unwrap()
        .into_iter()
        .map(|inner_path| {
            let mut content = Vec::new();
            pack.extract_to(&inner_path, &mut content).unwrap();
            (inner_path, fingerprint(&content))
        })
        .collect()
}

#[test]
fn test_same_behavior_across_packs() {
    let temp_dir = tempdir().unwrap();
    let names: Vec<String> = (0..25)
        .map(|i| format!("data/part{}/entry_{:02}.xml", i % 4, i))
        .collect();
    for mut pack in create_packs(temp_dir.path()) {
        for (i, name) in names.iter().enumerate() {
            pack.add(name, &mut payload(i).as_slice()).unwrap();
        }
        for name in names.iter().step_by(3) {
            pack.remove(name).unwrap();
            assert!(!pack.contains(name), "{}", pack.name());
        }
        pack.add(&names[0], &mut &b"replacement"[..]).unwrap();

        let expected: HashMap<String, u64> = names
            .iter()
            .enumerate()
            .filter(|(i, _)| i % 3 != 0)
            .map(|(i, name)| (name.clone(), fingerprint(&payload(i))))
            .chain(std::iter::once((
                names[0].clone(),
                fingerprint(b"replacement"),
            )))
            .collect();
        assert_eq!(expected, fingerprints(pack.as_ref()), "{}", pack.name());

        let sizes: HashSet<(String, u64)> = pack
            .list_sizes()
            .unwrap()
            .into_iter()
            .map(|s| (s.inner_path, s.size))
            .collect();
        assert!(sizes.contains(&(names[1].clone(), payload(1).len() as u64)));

        let result = pack.repack().unwrap();
        assert!(result.new_length <= result.old_length, "{}", pack.name());
        assert_eq!(expected, fingerprints(pack.as_ref()), "{}", pack.name());
        assert_eq!(0, pack.repack().unwrap().bytes_rewritten, "{}", pack.name());
        pack.close().unwrap();
    }
}

#[test]
fn test_usage_errors_across_packs() {
    let temp_dir = tempdir().unwrap();
    for mut pack in create_packs(temp_dir.path()) {
        pack.add("audio/a.ogg", &mut &b"a"[..]).unwrap();
        assert!(matches!(
            pack.add("audio/a.ogg", &mut &b"b"[..]),
            Err(PackError::DuplicateEntry(_))
        ));
        assert!(matches!(
            pack.add("audio\\b.ogg", &mut &b"b"[..]),
            Err(PackError::InvalidPath(_))
        ));
        let mut sink = Vec::new();
        assert!(matches!(
            pack.extract_to("audio/missing.ogg", &mut sink),
            Err(PackError::EntryNotFound(_))
        ));
        assert!(matches!(
            pack.remove("audio/missing.ogg"),
            Err(PackError::EntryNotFound(_))
        ));
        assert!(matches!(
            pack.open_read_stream("audio/missing.ogg"),
            Err(PackError::EntryNotFound(_))
        ));
        pack.close().unwrap();
        assert!(matches!(pack.list(), Err(PackError::Closed)), "{}", pack.name());
    }
}

#[test]
fn test_streams_are_independent() {
    let temp_dir = tempdir().unwrap();
    for mut pack in create_packs(temp_dir.path()) {
        let first = payload(3);
        let second = payload(5);
        pack.add("first.bin", &mut first.as_slice()).unwrap();
        pack.add("second.bin", &mut second.as_slice()).unwrap();

        let mut a = pack.open_read_stream("first.bin").unwrap();
        let mut b = pack.open_read_stream("second.bin").unwrap();
        let mut c = pack.open_read_stream("first.bin").unwrap();
        let (mut out_a, mut out_b, mut out_c) = (Vec::new(), Vec::new(), Vec::new());
        let mut buf = [0u8; 333];
        loop {
            let n_a = a.read(&mut buf).unwrap();
            out_a.extend_from_slice(&buf[..n_a]);
            let n_b = b.read(&mut buf[..100]).unwrap();
            out_b.extend_from_slice(&buf[..n_b]);
            let n_c = c.read(&mut buf[..17]).unwrap();
            out_c.extend_from_slice(&buf[..n_c]);
            if n_a + n_b + n_c == 0 {
                break;
            }
        }
        assert_eq!(first, out_a, "{}", pack.name());
        assert_eq!(second, out_b, "{}", pack.name());
        assert_eq!(first, out_c, "{}", pack.name());
    }
}

#[test]
fn test_reopen_with_detected_format() {
    let temp_dir = tempdir().unwrap();
    for mut pack in create_packs(temp_dir.path()) {
        pack.add("img/ship.png", &mut payload(11).as_slice()).unwrap();
        pack.close().unwrap();
    }
    for name in &["data.dat", "plain.pkg", "packed.pkg", "folder"] {
        let pack = open_pack(temp_dir.path().join(name), OpenMode::Read, small_options()).unwrap();
        let mut content = Vec::new();
        pack.extract_to("img/ship.png", &mut content).unwrap();
        assert_eq!(payload(11), content, "{}", name);
    }
}

use asdf_rs::file::AsdfFile;
use asdf_rs::tree::{NdArray, Node};
use asdf_rs::{AsdfConfig, AsdfError};

fn read_array(af: &AsdfFile, key: &str) -> Vec<u8> {
    af.tree()
        .get(key)
        .and_then(Node::as_array)
        .unwrap()
        .bytes()
        .unwrap()
        .as_ref()
        .clone()
}

#[test]
fn test_update_in_place_shrink() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("grow.asdf");

    let mut af = AsdfFile::new(AsdfConfig::default().with_padding(0.5));
    af.tree_mut().insert("a", NdArray::from_u8(vec![1u8; 64]).into());
    af.tree_mut().insert("b", NdArray::from_u8(vec![2u8; 64]).into());
    af.write_to_path(&path).unwrap();
    let original_size = std::fs::metadata(&path).unwrap().len();

    {
        let mut af = AsdfFile::open_rw(&path, AsdfConfig::default().with_padding(0.5)).unwrap();
        af.tree_mut().insert("a", NdArray::from_u8(vec![3u8; 32]).into());
        af.update().unwrap();

        // The updated handle itself must already see the new state.
        assert_eq!(read_array(&af, "a"), vec![3u8; 32]);
        assert_eq!(read_array(&af, "b"), vec![2u8; 64]);
    }

    let new_size = std::fs::metadata(&path).unwrap().len();
    assert!(
        new_size <= original_size,
        "shrinking an array must not grow the file ({original_size} -> {new_size})"
    );

    let af = AsdfFile::open(&path, AsdfConfig::default()).unwrap();
    assert_eq!(read_array(&af, "a"), vec![3u8; 32]);
    assert_eq!(read_array(&af, "b"), vec![2u8; 64]);
}

#[test]
fn test_update_without_changes_is_byte_stable() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stable.asdf");

    let mut af = AsdfFile::new(AsdfConfig::default());
    af.tree_mut().insert("a", NdArray::from_u8((0u8..64).collect()).into());
    af.tree_mut().insert("note", Node::from("unchanged"));
    af.write_to_path(&path).unwrap();
    let before = std::fs::read(&path).unwrap();

    {
        let mut af = AsdfFile::open_rw(&path, AsdfConfig::default()).unwrap();
        af.update().unwrap();
    }

    let after = std::fs::read(&path).unwrap();
    assert_eq!(before, after);
}

#[test]
fn test_update_add_array() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("add.asdf");

    let mut af = AsdfFile::new(AsdfConfig::default());
    af.tree_mut().insert("a", NdArray::from_u8(vec![1u8; 128]).into());
    af.write_to_path(&path).unwrap();

    {
        let mut af = AsdfFile::open_rw(&path, AsdfConfig::default()).unwrap();
        af.tree_mut().insert("c", NdArray::from_u8(vec![9u8; 16]).into());
        af.update().unwrap();
    }

    let af = AsdfFile::open(&path, AsdfConfig::default()).unwrap();
    assert_eq!(af.block_viewer().len(), 2);
    assert_eq!(read_array(&af, "a"), vec![1u8; 128]);
    assert_eq!(read_array(&af, "c"), vec![9u8; 16]);
}

#[test]
fn test_update_remove_array() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("remove.asdf");

    let mut af = AsdfFile::new(AsdfConfig::default());
    af.tree_mut().insert("a", NdArray::from_u8(vec![1u8; 64]).into());
    af.tree_mut().insert("b", NdArray::from_u8(vec![2u8; 64]).into());
    af.write_to_path(&path).unwrap();

    {
        let mut af = AsdfFile::open_rw(&path, AsdfConfig::default()).unwrap();
        af.set_tree({
            let mut tree = Node::mapping();
            tree.insert(
                "b",
                af.tree().get("b").and_then(Node::as_array).unwrap().clone().into(),
            );
            tree
        });
        af.update().unwrap();
    }

    let af = AsdfFile::open(&path, AsdfConfig::default()).unwrap();
    assert_eq!(af.block_viewer().len(), 1);
    assert!(af.tree().get("a").is_none());
    assert_eq!(read_array(&af, "b"), vec![2u8; 64]);
}

#[test]
fn test_update_grow_beyond_padding() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("big.asdf");

    let mut af = AsdfFile::new(AsdfConfig::default());
    af.tree_mut().insert("a", NdArray::from_u8(vec![1u8; 16]).into());
    af.tree_mut().insert("b", NdArray::from_u8(vec![2u8; 16]).into());
    af.write_to_path(&path).unwrap();

    {
        let mut af = AsdfFile::open_rw(&path, AsdfConfig::default()).unwrap();
        // Far larger than any slack the original allocation could hold.
        af.tree_mut()
            .insert("a", NdArray::from_u8(vec![4u8; 100_000]).into());
        af.update().unwrap();
    }

    let af = AsdfFile::open(&path, AsdfConfig::default()).unwrap();
    assert_eq!(read_array(&af, "a"), vec![4u8; 100_000]);
    assert_eq!(read_array(&af, "b"), vec![2u8; 16]);
}

#[test]
fn test_update_read_only_fails() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ro.asdf");

    let mut af = AsdfFile::new(AsdfConfig::default());
    af.tree_mut().insert("a", NdArray::from_u8(vec![1u8; 8]).into());
    af.write_to_path(&path).unwrap();

    let mut af = AsdfFile::open(&path, AsdfConfig::default()).unwrap();
    match af.update() {
        Err(AsdfError::ReadOnly) => {}
        other => panic!("expected ReadOnly, got {other:?}"),
    }
}

#[test]
fn test_update_without_file_fails() {
    let mut af = AsdfFile::new(AsdfConfig::default());
    af.tree_mut().insert("a", NdArray::from_u8(vec![1u8; 8]).into());
    match af.update() {
        Err(AsdfError::NoAssociatedFile) => {}
        other => panic!("expected NoAssociatedFile, got {other:?}"),
    }
}

use std::collections::HashSet;

use divid_storage::Column;

#[test]
fn column_names_are_unique_partition_names() {
    let mut names = HashSet::new();
    for (idx, column) in Column::ALL.iter().copied().enumerate() {
        assert_eq!(column.index(), idx);
        let name = column.as_str();
        assert!(
            name.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
            "partition name {name} must be lowercase"
        );
        assert!(names.insert(name), "duplicate partition name {name}");
    }
    assert_eq!(names.len(), Column::ALL.len());
}

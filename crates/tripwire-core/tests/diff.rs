//! Integration tests for unified-diff hunk parsing and position translation.

use tripwire_core::{parse_patch, FileDiff, Range};

const TWO_HUNKS: &str = "\
diff --git a/a.go b/a.go
--- a/a.go
+++ b/a.go
@@ -1,3 +1,4 @@
 a
-b
+B
+C
 d
@@ -10,2 +12,2 @@ func main() {
-x
+X
 y
";

#[test]
fn test_no_hunk_headers_is_empty() {
    assert!(parse_patch("").is_empty());
    assert!(parse_patch("Binary files a/logo.png and b/logo.png differ\n").is_empty());
    assert!(FileDiff::from_patch("logo.png", "blob", None).ranges.is_empty());
}

#[test]
fn test_two_hunks_ranges_and_offsets() {
    let ranges = parse_patch(TWO_HUNKS);
    assert_eq!(
        ranges,
        vec![
            Range {
                start: 1,
                end: 5,
                block_length: 6,
                offset: 0,
                deletions: vec![2],
            },
            Range {
                start: 12,
                end: 14,
                block_length: 4,
                offset: 6,
                deletions: vec![12],
            },
        ]
    );
}

#[test]
fn test_deletions_stay_in_their_hunk() {
    let patch = "@@ -1,2 +1,1 @@\n-gone\n kept\n@@ -20,1 +19,2 @@\n same\n+added\n";
    let ranges = parse_patch(patch);
    assert_eq!(ranges[0].deletions, vec![1]);
    assert!(ranges[1].deletions.is_empty());
    assert_eq!(ranges[1].offset, ranges[0].block_length);
}

#[test]
fn test_consecutive_deletions_share_a_counter() {
    let patch = "@@ -5,4 +5,2 @@\n keep\n-one\n-two\n keep\n";
    let ranges = parse_patch(patch);
    assert_eq!(ranges[0].deletions, vec![6, 6]);
    assert_eq!(ranges[0].block_length, 1 + 2 + 2);
}

#[test]
fn test_pure_deletion_hunk() {
    let patch = "@@ -3,2 +2,0 @@\n-a\n-b\n";
    let ranges = parse_patch(patch);
    assert_eq!(ranges[0].start, 2);
    assert_eq!(ranges[0].end, 2);
    assert_eq!(ranges[0].deletions, vec![2, 2]);
}

#[test]
fn test_oversized_hunk_header_is_ignored() {
    assert!(parse_patch("@@ -1 +4294967295,2 @@\n+a\n+b\n").is_empty());
}

#[test]
fn test_position_near_u32_max_does_not_overflow() {
    let diff = FileDiff {
        filename: "huge.txt".to_string(),
        sha: "blob".to_string(),
        ranges: vec![Range {
            start: 1,
            end: 3,
            block_length: 3,
            offset: u32::MAX - 1,
            deletions: vec![],
        }],
    };
    assert_eq!(diff.line_for_position(u32::MAX), None);
    assert_eq!(diff.position_for_line(1), Some(u32::MAX));
    assert_eq!(diff.position_for_line(2), None);
}

#[test]
fn test_position_to_line() {
    let diff = FileDiff::from_patch("a.go", "blob", Some(TWO_HUNKS));

    assert_eq!(diff.line_for_position(1), Some(1)); // " a"
    assert_eq!(diff.line_for_position(2), None); // "-b"
    assert_eq!(diff.line_for_position(3), Some(2)); // "+B"
    assert_eq!(diff.line_for_position(4), Some(3)); // "+C"
    assert_eq!(diff.line_for_position(5), Some(4)); // " d"
    assert_eq!(diff.line_for_position(6), None); // second header
    assert_eq!(diff.line_for_position(7), None); // "-x"
    assert_eq!(diff.line_for_position(8), Some(12)); // "+X"
    assert_eq!(diff.line_for_position(9), Some(13)); // " y"
    assert_eq!(diff.line_for_position(0), None);
    assert_eq!(diff.line_for_position(10), None);
}

#[test]
fn test_line_to_position() {
    let diff = FileDiff::from_patch("a.go", "blob", Some(TWO_HUNKS));
    assert_eq!(diff.position_for_line(1), Some(1));
    assert_eq!(diff.position_for_line(2), Some(3));
    assert_eq!(diff.position_for_line(12), Some(8));
    assert_eq!(diff.position_for_line(8), None);
    assert!(diff.covers_line(13));
    assert!(!diff.covers_line(14));
}

#[test]
fn test_position_round_trip_on_kept_lines() {
    let diff = FileDiff::from_patch("a.go", "blob", Some(TWO_HUNKS));
    for range in &diff.ranges {
        for line in range.start..range.end {
            let position = diff.position_for_line(line).unwrap();
            assert_eq!(diff.line_for_position(position), Some(line), "line {line}");
        }
    }
}

#[test]
fn test_file_record_starts_unreported() {
    let record = FileDiff::from_patch("a.go", "blob", Some(TWO_HUNKS)).into_file_record();
    assert_eq!(record.filename, "a.go");
    assert_eq!(record.ranges.len(), 2);
    assert!(record.reported.is_empty());
}

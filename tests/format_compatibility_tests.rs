use qemutrace2drcov::{to_writer, CoverageData, ModuleEntry};

fn encode(data: &CoverageData) -> String {
    let mut buffer = Vec::new();
    to_writer(data, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}

#[test]
fn test_header_layout() {
    let coverage = CoverageData::builder()
        .add_module("/bin/test", 0x100, 0xFFFFFF)
        .build()
        .unwrap();

    let output = encode(&coverage);
    let lines: Vec<&str> = output.split('\n').collect();
    assert_eq!(lines[0], "DRCOV VERSION: 2");
    assert_eq!(lines[1], "DRCOV FLAVOR: drcov");
    assert_eq!(lines[2], "Module Table: version 2, count 1");
    assert_eq!(
        lines[3],
        "Columns: id, base, end, entry, checksum, timestamp, path"
    );
    assert_eq!(
        lines[4],
        "  0, 0x00000000000100, 0x00000000ffffff, 0x00000000000000, 0x000000, 0x000000, /bin/test"
    );
    assert_eq!(lines[5], "BB Table: 0 bbs");
    assert_eq!(lines[6], "module id, start, size:");
    assert_eq!(lines[7], "");
    assert_eq!(lines.len(), 8);
}

#[test]
fn test_counts_and_row_order() {
    let modules = ["/bin/main", "/lib/libc.so", "/lib/libm.so"];
    let blocks = [(2u32, 0x30u64, 1u64), (0, 0x10, 9), (1, 0x20, 5), (0, 0x10, 9)];

    let mut builder = CoverageData::builder();
    for (i, path) in modules.iter().enumerate() {
        let base = 0x10000 * (i as u64 + 1);
        builder = builder.add_module(path, base, base + 0x1000);
    }
    for &(module_id, start, size) in &blocks {
        builder = builder.add_coverage(module_id, start, size);
    }
    let output = encode(&builder.build().unwrap());

    assert!(output.contains("Module Table: version 2, count 3\n"));
    assert!(output.contains("BB Table: 4 bbs\n"));

    let (header, body) = output.split_once("BB Table: ").unwrap();
    let module_rows: Vec<&str> = header.lines().skip(4).collect();
    assert_eq!(module_rows.len(), modules.len());
    for (i, (row, path)) in module_rows.iter().zip(modules.iter()).enumerate() {
        assert!(row.starts_with(&format!("{i:>3}, ")));
        assert!(row.ends_with(&format!(", {path}")));
    }

    let bb_rows: Vec<&str> = body.lines().skip(2).collect();
    assert_eq!(
        bb_rows,
        vec![
            "module[2]: 0x30, 1",
            "module[0]: 0x10, 9",
            "module[1]: 0x20, 5",
            "module[0]: 0x10, 9",
        ]
    );
    assert!(!output.ends_with('\n'));
}

#[test]
fn test_wide_module_fields() {
    let coverage = CoverageData::builder()
        .add_modules([ModuleEntry {
            id: 0,
            base: 0x7fff_0000_0000,
            end: u64::MAX,
            entry: 0x1234,
            checksum: 0xdeadbeef,
            timestamp: 0x1,
            path: "C:\\target.exe".to_string(),
        }])
        .add_coverage(0, u64::MAX, 1)
        .build()
        .unwrap();

    let output = encode(&coverage);
    assert!(output.contains(
        "  0, 0x007fff00000000, 0xffffffffffffffff, 0x00000000001234, 0xdeadbeef, 0x000001, C:\\target.exe\n"
    ));
    assert!(output.ends_with("module[0]: 0xffffffffffffffff, 1"));
}

#[test]
fn test_module_id_column_width() {
    let mut builder = CoverageData::builder();
    for i in 0..101u64 {
        builder = builder.add_module(&format!("m{i}"), i * 0x1000, i * 0x1000 + 0x1000);
    }
    let output = encode(&builder.build().unwrap());

    assert!(output.contains("\n  9, 0x00000000009000,"));
    assert!(output.contains("\n 10, 0x0000000000a000,"));
    assert!(output.contains("\n100, 0x00000000064000,"));
}

#[test]
fn test_default_flavor() {
    let coverage = CoverageData::builder()
        .add_module("a", 0, 1)
        .build()
        .unwrap();
    assert_eq!(coverage.header.flavor, "drcov");
    assert!(encode(&coverage).starts_with("DRCOV VERSION: 2\nDRCOV FLAVOR: drcov\n"));
}

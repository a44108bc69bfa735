/// mktest: generate deterministic test data under testdata/
///
/// Run with: cargo run --bin mktest
///
/// Wipes and recreates testdata/ from scratch. Layout:
///   testdata/reference/   the copies to keep
///   testdata/incoming/    a mix of copies of reference files and new files
///   testdata/legacy.csv   a comma-separated log for upgrade-cache
///
/// Expected duplicate groups after analyzing both trees:
///   "hello world\n"   3 files, one with commas in its name
///   "roses are red\n" 2 files
///   128 KB 0xAB block 2 files
use std::fs;
use std::io::Write;
use std::path::Path;

fn main() {
    let root = Path::new("testdata");

    if root.exists() {
        fs::remove_dir_all(root).expect("remove testdata");
    }

    // ── reference/ ────────────────────────────────────────────────────────────
    let reference = root.join("reference");
    write_file(&reference.join("hello.txt"), b"hello world\n");
    write_file(&reference.join("poems/roses.txt"), b"roses are red\n");
    write_file(&reference.join("only_here.txt"), b"kept, unique\n");
    let big_data = vec![0xABu8; 128 * 1024];
    write_file(&reference.join("big.bin"), &big_data);

    // ── incoming/ ─────────────────────────────────────────────────────────────
    let incoming = root.join("incoming");
    write_file(&incoming.join("copy of hello.txt"), b"hello world\n");
    write_file(&incoming.join("nested/hello, again, with commas.txt"), b"hello world\n");
    write_file(&incoming.join("nested/roses_copy.txt"), b"roses are red\n");
    write_file(&incoming.join("big_copy.bin"), &big_data);
    write_file(&incoming.join("new_a.txt"), b"unique content alpha\n");
    write_file(&incoming.join("nested/new_b.txt"), b"unique content beta\n");

    // ── legacy.csv ────────────────────────────────────────────────────────────
    // One line per historical format: with and without a host column.
    let legacy = "\
2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824,/old/hello.txt,oldbox\n\
2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824,/old/a, b.txt\n";
    write_file(&root.join("legacy.csv"), legacy.as_bytes());

    let job_dir = "testdata/jobs";
    println!("Test data created under testdata/");
    println!();
    println!("Expected duplicate groups:");
    println!("  \"hello world\\n\"    3 files   12 bytes each");
    println!("  \"roses are red\\n\"  2 files   14 bytes each");
    println!("  128 KB 0xAB block  2 files   131072 bytes each");
    println!();
    println!("Test commands (jobs isolated in {job_dir}/):");
    println!("  cargo run -- --job-dir {job_dir} analyze -j demo -d testdata/reference -d testdata/incoming");
    println!("  cargo run -- --job-dir {job_dir} report -j demo");
    println!("  cargo run -- --job-dir {job_dir} delete -j demo -d testdata/incoming --dry-run");
    println!("  cargo run -- --job-dir {job_dir} list-jobs");
    println!("  cargo run -- --job-dir {job_dir} upgrade-cache -j old -i testdata/legacy.csv -f v0.7 --accept oldbox");
}

fn write_file(path: &Path, content: &[u8]) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .unwrap_or_else(|e| panic!("create {}: {}", parent.display(), e));
    }
    let mut f = fs::File::create(path)
        .unwrap_or_else(|e| panic!("create {}: {}", path.display(), e));
    f.write_all(content)
        .unwrap_or_else(|e| panic!("write {}: {}", path.display(), e));
}

use std::sync::Arc;
use std::time::{Duration, Instant};
use clap::Parser;
use futures::future::try_join_all;
use kvsfs::storage::ROOT_INODE;
use kvsfs::{
    Backends, Credentials, FileHandle, FileLockOp, FileObject, FsManager, LockKind, LockOwner,
    LockRequest, MemoryKvs, OpenFlags,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "kvsfs data-path benchmark", long_about = None)]
struct Args {
    /// Number of files
    #[arg(short, long, default_value = "100")]
    num_files: usize,

    /// Small file size (bytes)
    #[arg(long, default_value = "1024")]
    small_size: usize,

    /// Large file size (bytes)
    #[arg(long, default_value = "10485760")]
    large_size: usize,

    /// Chunk size for large transfers (bytes)
    #[arg(long, default_value = "1048576")]
    chunk_size: usize,

    /// Lock/unlock cycles per file
    #[arg(long, default_value = "10")]
    lock_cycles: usize,
}

struct BenchmarkResult {
    operation: String,
    duration: Duration,
    ops_per_sec: f64,
    mb_per_sec: Option<f64>,
}

impl BenchmarkResult {
    fn new(operation: &str, duration: Duration, ops: usize, bytes: Option<usize>) -> Self {
        let ops_per_sec = ops as f64 / duration.as_secs_f64();
        let mb_per_sec = bytes.map(|b| (b as f64 / 1_048_576.0) / duration.as_secs_f64());

        Self {
            operation: operation.to_string(),
            duration,
            ops_per_sec,
            mb_per_sec,
        }
    }

    fn print(&self) {
        print!("  {:<30} {:>10.3} ms", self.operation, self.duration.as_secs_f64() * 1000.0);
        print!(" | {:>10.1} ops/s", self.ops_per_sec);
        if let Some(mb_per_sec) = self.mb_per_sec {
            print!(" | {:>8.2} MB/s", mb_per_sec);
        }
        println!();
    }
}

async fn open_files(kvs: &MemoryKvs, manager: &FsManager, prefix: &str, count: usize) -> anyhow::Result<Vec<FileHandle>> {
    let ctx = manager.open_filesystem("bench").await?;
    let creds = Credentials::current();
    let mut handles = Vec::with_capacity(count);
    for i in 0..count {
        let ino = kvs
            .create_object(&creds, ctx.tree(), ROOT_INODE, &format!("{}_{}", prefix, i))
            .await?;
        let mut handle = FileHandle::new(FileObject::new(ctx.clone(), ino));
        handle.open(creds, OpenFlags::ReadWrite).await?;
        handles.push(handle);
    }
    Ok(handles)
}

async fn write_chunked(handle: &FileHandle, data: &[u8], chunk_size: usize) -> anyhow::Result<()> {
    let mut offset = 0;
    for chunk in data.chunks(chunk_size.max(1)) {
        let (written, _stable) = handle.write(offset as u64, chunk).await?;
        offset += written;
    }
    Ok(())
}

async fn read_to_eof(handle: &FileHandle, chunk_size: usize) -> anyhow::Result<usize> {
    let mut offset = 0;
    loop {
        let (data, eof) = handle.read(offset as u64, chunk_size.max(1)).await?;
        if eof {
            return Ok(offset);
        }
        offset += data.len();
    }
}

async fn run_benchmark(args: &Args) -> anyhow::Result<Vec<BenchmarkResult>> {
    let mut results = Vec::new();
    let kvs = Arc::new(MemoryKvs::new());
    let manager = FsManager::new(Backends::memory(kvs.clone()));
    manager.create_filesystem("bench").await?;

    let small_data = vec![b'a'; args.small_size];
    let large_data = vec![b'b'; args.large_size];

    println!("\nOpening {} small files...", args.num_files);
    let start = Instant::now();
    let mut small = open_files(&kvs, &manager, "small", args.num_files).await?;
    results.push(BenchmarkResult::new("create + open", start.elapsed(), args.num_files, None));

    let start = Instant::now();
    for handle in &small {
        handle.write(0, &small_data).await?;
    }
    results.push(BenchmarkResult::new(
        "small write",
        start.elapsed(),
        args.num_files,
        Some(args.num_files * args.small_size),
    ));

    let start = Instant::now();
    for handle in &small {
        read_to_eof(handle, args.small_size).await?;
    }
    results.push(BenchmarkResult::new(
        "small read",
        start.elapsed(),
        args.num_files,
        Some(args.num_files * args.small_size),
    ));

    let start = Instant::now();
    let total = try_join_all(small.iter().map(|h| read_to_eof(h, args.small_size))).await?;
    results.push(BenchmarkResult::new(
        "small read (concurrent)",
        start.elapsed(),
        args.num_files,
        Some(total.iter().sum()),
    ));

    let start = Instant::now();
    let mut cycles = 0;
    for (i, handle) in small.iter().enumerate() {
        let owner = LockOwner(i as u64);
        let req = LockRequest::new(0, args.small_size as u64, LockKind::Write);
        for _ in 0..args.lock_cycles {
            handle.lock(FileLockOp::Lock, req, owner).await?;
            handle.lock(FileLockOp::Unlock, req, owner).await?;
            cycles += 1;
        }
    }
    results.push(BenchmarkResult::new("lock + unlock", start.elapsed(), cycles, None));

    let large_count = 10.min(args.num_files);
    println!("Opening {} large files...", large_count);
    let mut large = open_files(&kvs, &manager, "large", large_count).await?;

    let start = Instant::now();
    for handle in &large {
        write_chunked(handle, &large_data, args.chunk_size).await?;
    }
    results.push(BenchmarkResult::new(
        "large write",
        start.elapsed(),
        large_count,
        Some(large_count * args.large_size),
    ));

    let start = Instant::now();
    for handle in &large {
        read_to_eof(handle, args.chunk_size).await?;
    }
    results.push(BenchmarkResult::new(
        "large read",
        start.elapsed(),
        large_count,
        Some(large_count * args.large_size),
    ));

    let start = Instant::now();
    let closed = small.len() + large.len();
    for handle in small.iter_mut().chain(large.iter_mut()) {
        handle.close().await?;
    }
    results.push(BenchmarkResult::new("close", start.elapsed(), closed, None));

    manager.teardown().await;
    Ok(results)
}

fn print_results(results: &[BenchmarkResult]) {
    println!("\nResults:");
    println!("  {:<30} {:>13} | {:>16} | {:>13}", "operation", "time", "throughput", "bandwidth");
    println!("  {}", "-".repeat(80));
    for result in results {
        result.print();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    println!("kvsfs benchmark");
    println!("  files: {}", args.num_files);
    println!("  small file size: {} bytes", args.small_size);
    println!("  large file size: {} bytes", args.large_size);
    println!("  chunk size: {} bytes", args.chunk_size);

    let results = run_benchmark(&args).await?;
    print_results(&results);
    Ok(())
}

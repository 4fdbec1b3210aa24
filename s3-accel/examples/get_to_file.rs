//! Download one object to a local file with progress events.
//!
//! ```bash
//! AWS_REGION=eu-west-1 cargo run --example get_to_file -- my-bucket path/to/key ./out.bin
//! ```

use s3_accel::{DownloadOptions, EventKind, ObjectRef, download};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut args = std::env::args().skip(1);
    let (Some(bucket), Some(key), Some(dest)) = (args.next(), args.next(), args.next()) else {
        eprintln!("usage: get_to_file <bucket> <key> <dest>");
        std::process::exit(2);
    };

    let handle = download(
        ObjectRef::new(bucket, key),
        DownloadOptions::default().with_part_size_mb(8).with_concurrency(16),
    )?;

    handle.on(EventKind::ObjectDownloading, |event| {
        println!("probe complete: {event:?}");
    });
    handle.on(EventKind::PartDone, |event| {
        if let Some(part_no) = event.part_no() {
            println!("part {part_no} written");
        }
    });

    let meta = handle.meta().await?;
    println!("downloading {} bytes ({:?} parts)", meta.length_in_bytes, meta.parts);

    handle.to_file(&dest).await?;
    println!("saved to {dest}");
    Ok(())
}

//! End-to-end extraction tests over in-memory archives.

use std::io::Write;
use std::sync::Arc;

use byteorder::{LittleEndian, WriteBytesExt};
use flate2::Compression;
use flate2::write::DeflateEncoder;
use tokio::io::AsyncReadExt;

use zipcap::memory::FixedProbe;
use zipcap::{
    Error, ExtractOptions, FailurePolicy, FilterConfig, MemoryPhase, Payload,
    StreamingZipExtractor,
};

#[derive(Clone, Copy, PartialEq)]
enum Method {
    Stored,
    Deflate,
}

struct Member {
    name: String,
    data: Vec<u8>,
    method: Method,
    flags: u16,
}

impl Member {
    fn stored(name: &str, data: &[u8]) -> Self {
        Self {
            name: name.to_string(),
            data: data.to_vec(),
            method: Method::Stored,
            flags: 0,
        }
    }

    fn deflated(name: &str, data: &[u8]) -> Self {
        Self {
            method: Method::Deflate,
            ..Self::stored(name, data)
        }
    }

    fn directory(name: &str) -> Self {
        let name = if name.ends_with('/') {
            name.to_string()
        } else {
            format!("{name}/")
        };
        Self::stored(&name, &[])
    }

    fn encrypted(name: &str, data: &[u8]) -> Self {
        Self {
            flags: 0x0001,
            ..Self::stored(name, data)
        }
    }
}

/// Build a well-formed single-disk ZIP archive in memory.
fn build_archive(members: &[Member]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut records = Vec::new();

    for member in members {
        let lfh_offset = out.len() as u32;
        let mut crc = flate2::Crc::new();
        crc.update(&member.data);
        let crc32 = crc.sum();

        let compressed = match member.method {
            Method::Stored => member.data.clone(),
            Method::Deflate => {
                let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(&member.data).unwrap();
                encoder.finish().unwrap()
            }
        };
        let method = match member.method {
            Method::Stored => 0u16,
            Method::Deflate => 8u16,
        };

        // Local file header.
        out.extend_from_slice(b"PK\x03\x04");
        out.write_u16::<LittleEndian>(20).unwrap();
        out.write_u16::<LittleEndian>(member.flags).unwrap();
        out.write_u16::<LittleEndian>(method).unwrap();
        out.write_u16::<LittleEndian>(0).unwrap(); // mod time
        out.write_u16::<LittleEndian>(0).unwrap(); // mod date
        out.write_u32::<LittleEndian>(crc32).unwrap();
        out.write_u32::<LittleEndian>(compressed.len() as u32).unwrap();
        out.write_u32::<LittleEndian>(member.data.len() as u32).unwrap();
        out.write_u16::<LittleEndian>(member.name.len() as u16).unwrap();
        out.write_u16::<LittleEndian>(0).unwrap(); // extra length
        out.extend_from_slice(member.name.as_bytes());
        out.extend_from_slice(&compressed);

        records.push((member, compressed.len() as u32, crc32, lfh_offset, method));
    }

    let cd_offset = out.len() as u32;
    for (member, compressed_len, crc32, lfh_offset, method) in &records {
        out.extend_from_slice(b"PK\x01\x02");
        out.write_u16::<LittleEndian>(20).unwrap(); // version made by
        out.write_u16::<LittleEndian>(20).unwrap(); // version needed
        out.write_u16::<LittleEndian>(member.flags).unwrap();
        out.write_u16::<LittleEndian>(*method).unwrap();
        out.write_u16::<LittleEndian>(0).unwrap(); // mod time
        out.write_u16::<LittleEndian>(0).unwrap(); // mod date
        out.write_u32::<LittleEndian>(*crc32).unwrap();
        out.write_u32::<LittleEndian>(*compressed_len).unwrap();
        out.write_u32::<LittleEndian>(member.data.len() as u32).unwrap();
        out.write_u16::<LittleEndian>(member.name.len() as u16).unwrap();
        out.write_u16::<LittleEndian>(0).unwrap(); // extra length
        out.write_u16::<LittleEndian>(0).unwrap(); // comment length
        out.write_u16::<LittleEndian>(0).unwrap(); // disk number start
        out.write_u16::<LittleEndian>(0).unwrap(); // internal attrs
        out.write_u32::<LittleEndian>(0).unwrap(); // external attrs
        out.write_u32::<LittleEndian>(*lfh_offset).unwrap();
        out.extend_from_slice(member.name.as_bytes());
    }
    let cd_size = out.len() as u32 - cd_offset;

    out.extend_from_slice(b"PK\x05\x06");
    out.write_u16::<LittleEndian>(0).unwrap(); // disk number
    out.write_u16::<LittleEndian>(0).unwrap(); // disk with cd
    out.write_u16::<LittleEndian>(records.len() as u16).unwrap();
    out.write_u16::<LittleEndian>(records.len() as u16).unwrap();
    out.write_u32::<LittleEndian>(cd_size).unwrap();
    out.write_u32::<LittleEndian>(cd_offset).unwrap();
    out.write_u16::<LittleEndian>(0).unwrap(); // comment length
    out
}

fn extractor_with(
    members: &[Member],
    options: ExtractOptions,
) -> StreamingZipExtractor<zipcap::MemoryReader> {
    StreamingZipExtractor::open_buffer(build_archive(members), options)
}

#[tokio::test]
async fn reads_stored_and_deflated_entries() {
    let text = b"hello from a bounded extractor".repeat(100);
    let extractor = extractor_with(
        &[
            Member::stored("plain.txt", &text),
            Member::deflated("packed.txt", &text),
        ],
        ExtractOptions::default(),
    );

    let entries = extractor.extract_streams().await.unwrap();
    assert_eq!(entries.len(), 2);
    for entry in &entries {
        let mut reader = entry.open().await.unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, text, "mismatch for {}", entry.name());
    }
}

#[tokio::test]
async fn throttled_entry_stream_round_trips() {
    let data = b"flow controlled".repeat(2000);
    let extractor = extractor_with(
        &[Member::deflated("big.txt", &data)],
        ExtractOptions {
            high_water_mark: Some(2048),
            ..Default::default()
        },
    );
    let entries = extractor.extract_streams().await.unwrap();
    let stream = entries[0].open().await.unwrap();
    let mut throttled = extractor.backpressure().throttle(stream);
    let mut out = Vec::new();
    throttled.read_to_end(&mut out).await.unwrap();
    assert_eq!(out, data);
}

#[tokio::test]
async fn include_exclude_patterns_select_exactly() {
    let extractor = extractor_with(
        &[
            Member::stored("src/index.js", b"export {}"),
            Member::stored("src/index.test.js", b"test()"),
            Member::stored("README.md", b"# readme"),
        ],
        ExtractOptions {
            filter: Some(
                FilterConfig::new()
                    .include_patterns(["**/*.js"])
                    .exclude_patterns(["**/*.test.js"]),
            ),
            ..Default::default()
        },
    );

    let entries = extractor.extract_streams().await.unwrap();
    let names: Vec<_> = entries.iter().map(|e| e.name().to_string()).collect();
    assert_eq!(names, ["src/index.js"]);
}

#[tokio::test]
async fn traversal_names_never_survive() {
    let extractor = extractor_with(
        &[
            Member::stored("../evil.txt", b"nope"),
            Member::stored("/abs.txt", b"nope"),
            Member::stored("ok/safe.txt", b"fine"),
        ],
        ExtractOptions::default(),
    );
    let entries = extractor.extract_streams().await.unwrap();
    let names: Vec<_> = entries.iter().map(|e| e.name().to_string()).collect();
    assert_eq!(names, ["ok/safe.txt"]);
}

#[tokio::test]
async fn exhausted_budget_rejects_before_any_entry() {
    let extractor = extractor_with(
        &[Member::stored("a.txt", b"abc")],
        ExtractOptions {
            max_memory: Some(0),
            memory_probe: Some(Arc::new(FixedProbe(1))),
            ..Default::default()
        },
    );
    let err = extractor.extract_streams().await.unwrap_err();
    match err {
        Error::MemoryLimitExceeded { phase, .. } => {
            assert_eq!(phase, MemoryPhase::BeforeProcessing)
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn central_directory_allocation_respects_ceiling() {
    // The process itself reports zero usage, so only the central
    // directory buffer (hundreds of bytes for eight entries) can trip a
    // 64-byte ceiling.
    let members: Vec<Member> = (0..8)
        .map(|i| Member::stored(&format!("file-{i}.txt"), b"x"))
        .collect();
    let extractor = extractor_with(
        &members,
        ExtractOptions {
            max_memory: Some(64),
            memory_probe: Some(Arc::new(FixedProbe(0))),
            ..Default::default()
        },
    );
    let err = extractor.extract_streams().await.unwrap_err();
    match err {
        Error::MemoryLimitExceeded { phase, ceiling, .. } => {
            assert_eq!(phase, MemoryPhase::BeforeProcessing);
            assert_eq!(ceiling, 64);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn entry_count_guard_rejects_oversized_archives() {
    let extractor = extractor_with(
        &[
            Member::stored("a.txt", b"a"),
            Member::stored("b.txt", b"b"),
            Member::stored("c.txt", b"c"),
        ],
        ExtractOptions {
            max_entries: Some(2),
            ..Default::default()
        },
    );
    let err = extractor.extract_streams().await.unwrap_err();
    match err {
        Error::TooManyEntries { count, limit } => {
            assert_eq!(count, 3);
            assert_eq!(limit, 2);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn directories_cost_nothing() {
    let extractor = extractor_with(
        &[
            Member::directory("assets"),
            Member::stored("assets/logo.txt", b"logo"),
        ],
        ExtractOptions::default(),
    );
    let results = extractor.extract().await.unwrap();
    assert_eq!(results.len(), 2);
    assert!(results[0].is_directory);
    assert_eq!(results[0].size, 0);
    assert!(matches!(results[0].payload, Payload::Directory));
    match &results[1].payload {
        Payload::Whole(data) => assert_eq!(data, b"logo"),
        other => panic!("unexpected payload: {other:?}"),
    }
}

#[tokio::test]
async fn routing_splits_small_and_large_entries() {
    let big = b"0123456789".repeat(50);
    let extractor = extractor_with(
        &[
            Member::stored("small.bin", b"tiny"),
            Member::deflated("large.bin", &big),
        ],
        ExtractOptions {
            small_entry_limit: Some(16),
            chunk_size: Some(64),
            ..Default::default()
        },
    );
    let results = extractor.extract().await.unwrap();

    match &results[0].payload {
        Payload::Whole(data) => assert_eq!(data, b"tiny"),
        other => panic!("small entry not materialized whole: {other:?}"),
    }
    match &results[1].payload {
        Payload::Chunks(result) => {
            assert_eq!(result.total_size, big.len() as u64);
            let joined: Vec<u8> = result
                .chunks
                .iter()
                .flat_map(|c| c.iter().copied())
                .collect();
            assert_eq!(joined, big);
            assert!(result.chunks.iter().rev().skip(1).all(|c| c.len() == 64));
        }
        other => panic!("large entry not chunked: {other:?}"),
    }
}

#[tokio::test]
async fn parallel_extraction_preserves_archive_order() {
    let members: Vec<Member> = (0..12)
        .map(|i| {
            // Decreasing sizes so completion order differs from input order.
            let data = vec![i as u8; (12 - i) * 1000];
            Member::deflated(&format!("file-{i:02}.bin"), &data)
        })
        .collect();
    let extractor = extractor_with(
        &members,
        ExtractOptions {
            parallel: true,
            parallel_workers: 3,
            ..Default::default()
        },
    );

    let results = extractor.extract().await.unwrap();
    assert_eq!(results.len(), 12);
    for (i, result) in results.iter().enumerate() {
        assert_eq!(result.name, format!("file-{i:02}.bin"));
        match &result.payload {
            Payload::Whole(data) => {
                assert_eq!(data.len(), (12 - i) * 1000);
                assert!(data.iter().all(|&b| b == i as u8));
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }
}

#[tokio::test]
async fn encrypted_entries_fail_but_siblings_survive_under_skip() {
    let extractor = extractor_with(
        &[
            Member::encrypted("secret.txt", b"sealed"),
            Member::stored("open.txt", b"readable"),
        ],
        ExtractOptions {
            on_failure: FailurePolicy::Skip,
            ..Default::default()
        },
    );
    let results = extractor.extract().await.unwrap();
    assert!(matches!(results[0].payload, Payload::Failed(_)));
    match &results[1].payload {
        Payload::Whole(data) => assert_eq!(data, b"readable"),
        other => panic!("unexpected payload: {other:?}"),
    }
}

#[tokio::test]
async fn midstream_ceiling_breach_aborts_extraction() {
    let big = vec![7u8; 200_000];
    let extractor = extractor_with(
        &[Member::stored("big.bin", &big)],
        ExtractOptions {
            max_memory: Some(50_000),
            memory_probe: Some(Arc::new(FixedProbe(0))),
            ..Default::default()
        },
    );
    let err = extractor.extract().await.unwrap_err();
    match err {
        Error::MemoryLimitExceeded { phase, .. } => {
            assert_eq!(phase, MemoryPhase::DuringProcessing)
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn extracts_from_an_archive_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fixture.zip");
    std::fs::write(
        &path,
        build_archive(&[
            Member::stored("notes.txt", b"on disk"),
            Member::deflated("data.bin", &[42u8; 5000]),
        ]),
    )
    .unwrap();

    let extractor =
        StreamingZipExtractor::open_path(&path, ExtractOptions::default()).unwrap();
    let results = extractor.extract().await.unwrap();
    assert_eq!(results.len(), 2);
    match &results[0].payload {
        Payload::Whole(data) => assert_eq!(data, b"on disk"),
        other => panic!("unexpected payload: {other:?}"),
    }
    match &results[1].payload {
        Payload::Whole(data) => assert_eq!(data.as_slice(), &[42u8; 5000][..]),
        other => panic!("unexpected payload: {other:?}"),
    }
}

#[tokio::test]
async fn missing_file_is_an_open_error() {
    let err = StreamingZipExtractor::open_path(
        std::path::Path::new("/nonexistent/archive.zip"),
        ExtractOptions::default(),
    )
    .unwrap_err();
    assert!(matches!(err, Error::ArchiveOpen { .. }));
}

#[tokio::test]
async fn garbage_input_is_an_open_error() {
    let extractor = StreamingZipExtractor::open_buffer(
        vec![0u8; 4096],
        ExtractOptions::default(),
    );
    let err = extractor.extract_streams().await.unwrap_err();
    assert!(matches!(err, Error::ArchiveOpen { .. }));
}

#[tokio::test]
async fn archive_comment_does_not_hide_the_eocd() {
    let mut data = build_archive(&[Member::stored("a.txt", b"abc")]);
    let comment = b"written by a test";
    let len = data.len();
    data[len - 2..].copy_from_slice(&(comment.len() as u16).to_le_bytes());
    data.extend_from_slice(comment);

    let extractor = StreamingZipExtractor::open_buffer(data, ExtractOptions::default());
    let entries = extractor.extract_streams().await.unwrap();
    assert_eq!(entries[0].name(), "a.txt");
}

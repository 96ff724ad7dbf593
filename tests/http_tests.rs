//! Byte-range HTTP reads against a minimal in-process server.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};

use asdf_rs::file::AsdfFile;
use asdf_rs::tree::{NdArray, Node};
use asdf_rs::AsdfConfig;

/// Serve `content` forever, honoring `Range: bytes=a-b` when `ranged`.
fn spawn_server(content: Vec<u8>, ranged: bool) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    std::thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(stream) = stream else { break };
            let _ = handle(stream, &content, ranged);
        }
    });
    format!("http://{addr}/data.asdf")
}

fn handle(mut stream: TcpStream, content: &[u8], ranged: bool) -> std::io::Result<()> {
    let mut request = Vec::new();
    let mut byte = [0u8; 1];
    while !request.ends_with(b"\r\n\r\n") {
        if stream.read(&mut byte)? == 0 {
            return Ok(());
        }
        request.push(byte[0]);
    }
    let request = String::from_utf8_lossy(&request);

    let range = request
        .lines()
        .find_map(|line| line.to_ascii_lowercase().strip_prefix("range: bytes=").map(str::to_string));

    if !ranged {
        let header = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            content.len()
        );
        stream.write_all(header.as_bytes())?;
        stream.write_all(content)?;
        return Ok(());
    }

    let (start, end) = match range.as_deref() {
        Some(spec) => {
            let (a, b) = spec.split_once('-').unwrap_or((spec, ""));
            let start: usize = a.parse().unwrap_or(0);
            let end: usize = b
                .parse::<usize>()
                .map(|e| (e + 1).min(content.len()))
                .unwrap_or(content.len());
            (start, end)
        }
        None => (0, content.len()),
    };
    let body = &content[start.min(content.len())..end];
    let header = format!(
        "HTTP/1.1 206 Partial Content\r\nAccept-Ranges: bytes\r\nContent-Range: bytes {}-{}/{}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        start,
        end.saturating_sub(1),
        content.len(),
        body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    Ok(())
}

fn sample_file() -> Vec<u8> {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sample.asdf");
    let mut af = AsdfFile::new(AsdfConfig::default());
    af.tree_mut()
        .insert("a", NdArray::from_u8((0u8..=255).cycle().take(30_000).collect()).into());
    af.tree_mut().insert("label", Node::from("remote"));
    af.write_to_path(&path).unwrap();
    std::fs::read(&path).unwrap()
}

#[test]
fn test_http_range_reads() {
    let content = sample_file();
    let url = spawn_server(content, true);

    let af = AsdfFile::open_uri(&url, AsdfConfig::default()).unwrap();
    assert_eq!(af.tree().get("label"), Some(&Node::from("remote")));
    let array = af.tree().get("a").and_then(Node::as_array).unwrap();
    let bytes = array.bytes().unwrap();
    assert_eq!(bytes.len(), 30_000);
    assert_eq!(bytes[0], 0);
    assert_eq!(bytes[256], 0);
    assert_eq!(bytes[511], 255);
}

#[test]
fn test_http_without_ranges_degrades_to_stream() {
    let content = sample_file();
    let url = spawn_server(content, false);

    let af = AsdfFile::open_uri(&url, AsdfConfig::default()).unwrap();
    let array = af.tree().get("a").and_then(Node::as_array).unwrap();
    assert_eq!(array.bytes().unwrap().len(), 30_000);
}

use std::io::Read;

use blobseal_crypto::{
    decryption_stream, encryption_stream, BlobEncryptionMetadata, BytesStream, DEFAULT_PACKET_LENGTH,
};

fn make_data(size: usize) -> Vec<u8> {
    (0..size)
        .map(|i| (i.wrapping_mul(7) ^ (i >> 3)) as u8)
        .collect()
}

#[divan::bench(args = [1024, 65536, 1048576])]
fn bench_encrypt_stream(bencher: divan::Bencher, size: usize) {
    let metadata = BlobEncryptionMetadata::generate(DEFAULT_PACKET_LENGTH).unwrap();
    let data = make_data(size);
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| {
            let mut out = Vec::with_capacity(size + 1024);
            encryption_stream(BytesStream::new(divan::black_box(&data[..])), &metadata)
                .read_to_end(&mut out)
                .unwrap();
            out
        });
}

#[divan::bench(args = [1024, 65536, 1048576])]
fn bench_decrypt_stream(bencher: divan::Bencher, size: usize) {
    let metadata = BlobEncryptionMetadata::generate(DEFAULT_PACKET_LENGTH).unwrap();
    let data = make_data(size);
    let mut encrypted = Vec::new();
    encryption_stream(BytesStream::new(&data[..]), &metadata)
        .read_to_end(&mut encrypted)
        .unwrap();
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| {
            let mut out = Vec::with_capacity(size);
            decryption_stream(BytesStream::new(divan::black_box(&encrypted[..])), &metadata)
                .read_to_end(&mut out)
                .unwrap();
            out
        });
}

fn main() {
    divan::main();
}

//! Basic usage example for gdiff.

use gdiff::{
    Delta, DebugWriter, DeltaOptions, SliceSource, WriterOptions, decode, encode, encode_with,
    merge_bytes,
};

fn main() {
    // Example 1: Simple text modification
    println!("=== Example 1: Simple Text Modification ===");
    let base_text = b"The quick brown fox jumps over the lazy dog";
    let new_text = b"The quick brown cat jumps over the lazy dog";

    match encode(base_text, new_text) {
        Ok(delta) => {
            println!("Base text: {:?}", String::from_utf8_lossy(base_text));
            println!("New text:  {:?}", String::from_utf8_lossy(new_text));
            println!("Delta size: {} bytes", delta.len());

            match decode(&delta, base_text) {
                Ok(recovered) => {
                    assert_eq!(recovered, new_text);
                    println!("✓ Successfully decoded and verified!");
                }
                Err(e) => eprintln!("Decode error: {}", e),
            }
        }
        Err(e) => eprintln!("Encode error: {}", e),
    }

    println!();

    // Example 2: Large data with small changes, both offset encodings
    println!("=== Example 2: Large Data with Small Changes ===");
    let size = 100_000;
    let base_data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
    let mut new_data = base_data.clone();
    for i in (0..size).step_by(500) {
        new_data[i] = new_data[i].wrapping_add(1);
    }

    for differential in [false, true] {
        let writer = WriterOptions::new().differential(differential);
        match encode_with(&base_data, &new_data, &DeltaOptions::default(), writer) {
            Ok(delta) => {
                println!(
                    "{} offsets: delta {} bytes, ratio {:.2}x",
                    if differential { "Differential" } else { "Absolute" },
                    delta.len(),
                    size as f64 / delta.len() as f64
                );
                match decode(&delta, &base_data) {
                    Ok(recovered) => assert_eq!(recovered, new_data),
                    Err(e) => eprintln!("Decode error: {}", e),
                }
            }
            Err(e) => eprintln!("Encode error: {}", e),
        }
    }

    println!();

    // Example 3: Document versioning with merged deltas
    println!("=== Example 3: Document Versioning ===");
    let version1 = b"# Project Documentation\n\
                     ## Overview\n\
                     This is the initial version of our project.\n\
                     It contains basic information.\n";

    let version2 = b"# Project Documentation\n\
                     ## Overview\n\
                     This is version 2 of our project.\n\
                     It contains basic information.\n\
                     ## New Section\n\
                     Additional content here.\n";

    let version3 = b"# Project Documentation\n\
                     ## Overview\n\
                     This is version 3 of our project.\n\
                     It contains basic information.\n\
                     ## New Section\n\
                     Additional content here, and more.\n";

    let result = encode(version1, version2).and_then(|v1_v2| {
        let v2_v3 = encode(version2, version3)?;
        let v1_v3 = merge_bytes(&v1_v2, &v2_v3, WriterOptions::default())?;
        println!("Delta v1->v2: {} bytes", v1_v2.len());
        println!("Delta v2->v3: {} bytes", v2_v3.len());
        println!("Merged v1->v3: {} bytes", v1_v3.len());
        decode(&v1_v3, version1)
    });

    match result {
        Ok(recovered) => {
            assert_eq!(recovered, version3);
            println!("✓ Reconstructed version 3 from version 1 and the merged delta!");
        }
        Err(e) => eprintln!("Merge error: {}", e),
    }

    println!();

    // Example 4: Inspecting the instructions
    println!("=== Example 4: Instruction Dump ===");
    let mut delta = Delta::new();
    let mut dump = DebugWriter::new(Vec::new());
    match delta.compute(&mut SliceSource::new(version1), &version2[..], &mut dump) {
        Ok(stats) => {
            print!("{}", String::from_utf8_lossy(&dump.into_inner()));
            println!(
                "{} bytes copied in {} copies, {} literal bytes",
                stats.copied, stats.copies, stats.literal_bytes
            );
        }
        Err(e) => eprintln!("Diff error: {}", e),
    }

    println!();
    println!("=== All Examples Completed ===");
}

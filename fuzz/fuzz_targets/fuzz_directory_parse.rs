#![no_main]
use libfuzzer_sys::fuzz_target;
use pakfile::core::directory::ContentDirectory;
use pakfile::core::integrity::IntegrityLedger;
use pakfile::core::io::DirectoryImage;
use pakfile::core::signature::check_directory_signature;

// Arbitrary directory files must be rejected or parsed, never panic
fuzz_target!(|data: &[u8]| {
    let _ = check_directory_signature(data, &[0u8; 32]);

    // Raw tree bytes on their own
    if let Ok(directory) = ContentDirectory::parse_tree(data) {
        let tree = directory.serialize_tree();
        let reparsed = ContentDirectory::parse_tree(&tree).expect("serialized tree must parse");
        assert_eq!(reparsed.len(), directory.len());
    }

    let Ok(image) = DirectoryImage::parse(data) else {
        return;
    };
    let _ = image.metadata_matches();
    let _ = IntegrityLedger::from_sections(image.fraction_section, image.metadata_section);
    let _ = ContentDirectory::parse_tree(image.tree);
});

//! Binary patching of a client executable with UTF-16LE payloads.

use quarry_lib::{BinaryPatcher, Encoding, ReplacementRule};

fn utf16le(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(|u| u.to_le_bytes()).collect()
}

/// A fake PE-ish blob: binary noise around a UTF-16LE hostname.
fn fake_executable() -> Vec<u8> {
    let mut blob = vec![0x4D, 0x5A, 0x90, 0x00, 0x03, 0x00];
    blob.extend(std::iter::repeat(0xCC).take(64));
    blob.extend(utf16le("play.hytale.com"));
    blob.extend(std::iter::repeat(0x00).take(32));
    blob.extend(b"plain ascii hytale.com mention");
    blob
}

#[tokio::test]
async fn utf16_domain_swap_preserves_length_and_surroundings() {
    let tmp = tempfile::tempdir().unwrap();
    let exe = tmp.path().join("HytaleClient");
    let original = fake_executable();
    tokio::fs::write(&exe, &original).await.unwrap();

    let rules = vec![ReplacementRule::SmartDomain {
        old: "hytale.com".into(),
        new: "sanasol.ws".into(),
    }];
    let report = BinaryPatcher::patch(&exe, &rules, Encoding::Utf16Le)
        .await
        .unwrap();
    assert_eq!(report.replacements, 1);

    let patched = tokio::fs::read(&exe).await.unwrap();
    assert_eq!(patched.len(), original.len());

    // The UTF-16 region now carries the replacement hostname.
    let needle = utf16le("play.sanasol.ws");
    assert!(patched
        .windows(needle.len())
        .any(|w| w == needle.as_slice()));

    // Bytes outside the match are untouched, including the ASCII mention
    // that does not decode as UTF-16.
    assert_eq!(&patched[..70], &original[..70]);
    let tail = b"plain ascii hytale.com mention";
    assert!(patched.windows(tail.len()).any(|w| w == tail.as_slice()));
}

#[tokio::test]
async fn second_invocation_is_a_no_op() {
    let tmp = tempfile::tempdir().unwrap();
    let exe = tmp.path().join("HytaleClient");
    tokio::fs::write(&exe, fake_executable()).await.unwrap();

    let rules = vec![ReplacementRule::SmartDomain {
        old: "hytale.com".into(),
        new: "sanasol.ws".into(),
    }];

    let first = BinaryPatcher::patch(&exe, &rules, Encoding::Utf16Le)
        .await
        .unwrap();
    assert_eq!(first.replacements, 1);
    let after_first = tokio::fs::read(&exe).await.unwrap();

    let second = BinaryPatcher::patch(&exe, &rules, Encoding::Utf16Le)
        .await
        .unwrap();
    assert_eq!(second.replacements, 0);
    assert_eq!(tokio::fs::read(&exe).await.unwrap(), after_first);

    // Flag sidecar is present and survives both calls.
    assert!(tmp.path().join("HytaleClient.patched_custom").exists());
}

#[tokio::test]
async fn mixed_rules_apply_in_order() {
    let tmp = tempfile::tempdir().unwrap();
    let exe = tmp.path().join("HytaleClient");
    tokio::fs::write(&exe, b"endpoint=api.hytale.com mode=login-prod")
        .await
        .unwrap();

    let rules = vec![
        ReplacementRule::SmartDomain {
            old: "hytale.com".into(),
            new: "sanasol.ws".into(),
        },
        ReplacementRule::Simple {
            old: "login-prod".into(),
            new: "login-test".into(),
        },
    ];
    let report = BinaryPatcher::patch(&exe, &rules, Encoding::Utf8)
        .await
        .unwrap();
    assert_eq!(report.replacements, 2);

    let patched = tokio::fs::read_to_string(&exe).await.unwrap();
    assert_eq!(patched, "endpoint=api.sanasol.ws mode=login-test");
}

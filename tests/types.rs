// ABOUTME: Integration tests for image references, service names and run ids.
// ABOUTME: Covers parsing, validation, per-run tags and serde forms.

use rollout::types::*;

mod image_ref_tests {
    use super::*;

    #[test]
    fn parse_simple_name() {
        let img = ImageRef::parse("nginx").unwrap();
        assert_eq!(img.name(), "nginx");
        assert_eq!(img.tag(), Some("latest"));
        assert!(img.registry().is_none());
        assert!(img.digest().is_none());
    }

    #[test]
    fn parse_name_with_tag() {
        let img = ImageRef::parse("nginx:1.25").unwrap();
        assert_eq!(img.name(), "nginx");
        assert_eq!(img.tag(), Some("1.25"));
    }

    #[test]
    fn parse_with_registry() {
        let img = ImageRef::parse("registry.example.com/myapp:v1.2.3").unwrap();
        assert_eq!(img.registry(), Some("registry.example.com"));
        assert_eq!(img.name(), "myapp");
        assert_eq!(img.tag(), Some("v1.2.3"));
    }

    #[test]
    fn parse_with_org() {
        let img = ImageRef::parse("ghcr.io/org/repo:latest").unwrap();
        assert_eq!(img.registry(), Some("ghcr.io"));
        assert_eq!(img.name(), "org/repo");
        assert_eq!(img.tag(), Some("latest"));
    }

    #[test]
    fn parse_with_digest() {
        let digest = "sha256:abc123def456";
        let img = ImageRef::parse(&format!("nginx@{}", digest)).unwrap();
        assert_eq!(img.name(), "nginx");
        assert_eq!(img.digest(), Some(digest));
        assert!(img.tag().is_none());
    }

    #[test]
    fn parse_full_reference() {
        let img = ImageRef::parse("ghcr.io/org/repo:v1@sha256:abc123").unwrap();
        assert_eq!(img.registry(), Some("ghcr.io"));
        assert_eq!(img.name(), "org/repo");
        assert_eq!(img.tag(), Some("v1"));
        assert_eq!(img.digest(), Some("sha256:abc123"));
    }

    #[test]
    fn rejects_malformed_references() {
        assert!(matches!(ImageRef::parse(""), Err(ParseImageRefError::Empty)));
        assert!(matches!(
            ImageRef::parse("invalid image!"),
            Err(ParseImageRefError::InvalidChar(' '))
        ));
        assert!(matches!(
            ImageRef::parse("ghcr.io//repo"),
            Err(ParseImageRefError::EmptyComponent(_))
        ));
        assert!(matches!(
            ImageRef::parse("nginx:-bad"),
            Err(ParseImageRefError::InvalidTag(_))
        ));
        assert!(matches!(
            ImageRef::parse("nginx:"),
            Err(ParseImageRefError::InvalidTag(_))
        ));
    }

    #[test]
    fn serde_uses_the_written_form() {
        let img: ImageRef = serde_json::from_str("\"registry.local/web:abc123\"").unwrap();
        assert_eq!(img.registry(), Some("registry.local"));
        assert_eq!(serde_json::to_string(&img).unwrap(), "\"registry.local/web:abc123\"");
        assert!(serde_json::from_str::<ImageRef>("\"web:\"").is_err());
    }

    #[test]
    fn with_tag_repins_and_drops_digest() {
        let img = ImageRef::parse("ghcr.io/org/repo:v1@sha256:abc123").unwrap();
        let pinned = img.with_tag("0f3c9a7e21b4");
        assert_eq!(pinned.to_string(), "ghcr.io/org/repo:0f3c9a7e21b4");
        assert_eq!(pinned.repository(), "ghcr.io/org/repo");
    }

    #[test]
    fn registry_port_is_not_a_tag() {
        let img = ImageRef::parse("localhost:5000/web").unwrap();
        assert_eq!(img.registry(), Some("localhost:5000"));
        assert_eq!(img.name(), "web");
        assert_eq!(img.tag(), Some("latest"));
    }

    #[test]
    fn display_formats_correctly() {
        let img = ImageRef::parse("ghcr.io/org/repo:v1").unwrap();
        assert_eq!(img.to_string(), "ghcr.io/org/repo:v1");
    }
}

mod service_name_tests {
    use super::*;

    #[test]
    fn accepts_dns_labels_up_to_63_chars() {
        for name in ["web", "my-service", "api2", &"a".repeat(63)] {
            let parsed = ServiceName::new(name).unwrap();
            assert_eq!(parsed.as_str(), name);
        }
    }

    #[test]
    fn rejects_names_platforms_would_refuse() {
        let too_long = "a".repeat(64);
        for name in ["", "-service", "service-", "MyService", "web_app", "web.app", &too_long] {
            assert!(ServiceName::new(name).is_err(), "{:?} should be rejected", name);
        }
    }

    #[test]
    fn suffixed_names_companion_objects() {
        let name = ServiceName::new("web").unwrap();
        assert_eq!(name.suffixed("hpa"), "web-hpa");
        assert_eq!(name.suffixed("pdb"), "web-pdb");
    }

    #[test]
    fn deserialization_validates() {
        assert!(serde_json::from_str::<ServiceName>("\"web\"").is_ok());
        assert!(serde_json::from_str::<ServiceName>("\"Web\"").is_err());
    }
}

mod id_tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn generated_run_ids_are_unique() {
        let ids: HashSet<RunId> = (0..100).map(|_| RunId::generate()).collect();
        assert_eq!(ids.len(), 100);
    }

    #[test]
    fn short_form_is_a_prefix_usable_as_a_tag() {
        let run = RunId::generate();
        assert_eq!(run.short().len(), 12);
        assert!(run.as_str().starts_with(run.short()));
        assert!(ImageRef::parse(&format!("web:{}", run.short())).is_ok());
    }

    #[test]
    fn short_form_of_a_short_id_is_the_id() {
        assert_eq!(RunId::new("abc").short(), "abc");
    }

    #[test]
    fn ids_serialize_as_plain_strings() {
        let host = HostId::new("deploy.example.com:22");
        assert_eq!(serde_json::to_string(&host).unwrap(), "\"deploy.example.com:22\"");
        let back: HostId = serde_json::from_str("\"deploy.example.com:22\"").unwrap();
        assert_eq!(back, host);
    }
}

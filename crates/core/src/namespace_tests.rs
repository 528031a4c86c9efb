use super::*;

#[test]
fn scoped_name_joins_with_slash() {
    assert_eq!(scoped_name("antcode", "ready"), "antcode/ready");
}

#[test]
fn scoped_name_empty_namespace_is_bare_name() {
    assert_eq!(scoped_name("", "ready"), "ready");
}

#[test]
fn split_scoped_name_round_trips() {
    let scoped = scoped_name("antcode", "ready");
    assert_eq!(split_scoped_name(&scoped), ("antcode", "ready"));
}

#[test]
fn split_scoped_name_without_namespace() {
    assert_eq!(split_scoped_name("ready"), ("", "ready"));
}

#[test]
fn namespace_to_option_maps_empty_to_none() {
    assert_eq!(namespace_to_option(""), None);
    assert_eq!(namespace_to_option("antcode"), Some("antcode"));
}

#[test]
fn namespace_newtype_deref_and_display() {
    let ns = Namespace::new("antcode");
    assert_eq!(&*ns, "antcode");
    assert_eq!(ns.to_string(), "antcode");
    assert_eq!(ns.to_option(), Some("antcode"));
}

#[test]
fn default_namespace_is_empty() {
    let ns = Namespace::default();
    assert_eq!(ns.to_option(), None);
    assert_eq!(ns.into_inner(), "");
}

use reaper_source_index::{index_source, FunctionKind, SourceIndex, UnitKind};

fn index(file: &str, code: &str) -> SourceIndex {
    index_source(file, code)
        .expect("indexing failed")
        .into_index()
        .expect("source should parse")
}

#[test]
fn nested_functions_form_a_parent_chain() {
    let code = r"
function outer() {
    function middle() {
        return () => {
            return function () {};
        };
    }
    return middle;
}
";

    let index = index("nested.js", code);
    let labels: Vec<_> = index
        .functions()
        .iter()
        .map(|f| (f.label.as_str(), f.depth))
        .collect();
    assert_eq!(
        labels,
        vec![("outer", 0), ("middle", 1), ("middle>0", 2), ("middle>0>0", 3)]
    );

    for function in index.functions().iter().skip(1) {
        let parent = function.parent.as_ref().expect("nested function has parent");
        let parent = index.get(parent).expect("parent indexed");
        assert!(parent.contains_range(function.start_offset, function.end_offset));
    }
}

#[test]
fn class_members_removable_as_class_members() {
    let code = r"
class Store {
    load() { return 1; }
    handler = () => this.load();
    static create() { return new Store(); }
}
";

    let index = index("store.js", code);
    let members: Vec<_> = index
        .functions()
        .iter()
        .map(|f| (f.label.as_str(), f.kind, f.removal.map(|u| u.kind)))
        .collect();
    assert_eq!(
        members,
        vec![
            ("load", FunctionKind::Method, Some(UnitKind::ClassMember)),
            ("handler", FunctionKind::Arrow, Some(UnitKind::ClassMember)),
            ("create", FunctionKind::Method, Some(UnitKind::ClassMember)),
        ]
    );
}

#[test]
fn typescript_sources_are_indexed() {
    let code = r"
export function typed(value: number): string {
    return String(value);
}

const local = (x: string): number => x.length;
local('a');
";

    let index = index("lib.ts", code);
    assert_eq!(index.len(), 2);
    let typed = index.by_name("typed").next().expect("typed");
    assert!(typed.exported);
    assert!(typed.is_export_only_signal());
    let local = index.by_name("local").next().expect("local");
    assert!(!local.has_dynamic_reference_signal());
}

#[test]
fn revision_tracks_content() {
    let a = index("a.js", "function a() {}");
    let b = index("a.js", "function a() { }");
    assert_ne!(a.revision, b.revision);
    assert_eq!(a.revision, index("a.js", "function a() {}").revision);
}

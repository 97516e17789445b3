use promptloom::promptloom::extract::{
    extract_function_definitions, rename_first_identifier, sanitize_code, with_docstring_addendum,
};
use rhai::Engine;

const DOUBLER_SRC: &str = "/// Doubles the given number.\nfn doubler(n) {\n    n * 2\n}";

// Fence robustness: the three synthesis shapes parse to the same skill set.
#[test]
fn test_fence_robustness() {
    let engine = Engine::new();

    let bare = DOUBLER_SRC.to_string();
    let plain_fence = format!("```\n{}\n```", DOUBLER_SRC);
    let lang_fence = format!("```rhai\n{}\n```", DOUBLER_SRC);

    let mut parsed = Vec::new();
    for form in [bare, plain_fence, lang_fence].iter() {
        let cleaned = sanitize_code(form);
        parsed.push(extract_function_definitions(&engine, &cleaned));
    }

    assert_eq!(parsed[0].len(), 1);
    assert_eq!(parsed[0], parsed[1]);
    assert_eq!(parsed[1], parsed[2]);
    assert_eq!(parsed[0][0].script_name, "doubler");
}

#[test]
fn test_sanitize_strips_surrounding_blank_lines() {
    let cleaned = sanitize_code("\n\n```\nfn f() { 1 }\n```\n\n");
    assert_eq!(cleaned, "fn f() { 1 }");
}

#[test]
fn test_sanitize_leaves_inner_fences_alone() {
    // Only one leading and one trailing fence are removed.
    let cleaned = sanitize_code("```\nlet s = \"```\";\n```");
    assert_eq!(cleaned, "let s = \"```\";");
}

// The rename pass replaces the first occurrence of the identifier `code`,
// respecting identifier boundaries.
#[test]
fn test_rename_respects_identifier_boundaries() {
    let renamed = rename_first_identifier(
        "fn encode(s) { s }\nfn code(n) { n }\nfn code_helper() { 0 }",
        "code",
        "message_3_code",
    );
    assert!(renamed.contains("fn encode(s)"));
    assert!(renamed.contains("fn message_3_code(n)"));
    // Only the first boundary occurrence is replaced.
    assert!(renamed.contains("fn code_helper()"));
}

#[test]
fn test_rename_without_occurrence_is_identity() {
    let src = "fn doubler(n) { n * 2 }";
    assert_eq!(rename_first_identifier(src, "code", "message_0_code"), src);
}

// Unparsable text produces no descriptors.
#[test]
fn test_parse_failure_yields_empty_list() {
    let engine = Engine::new();
    assert!(extract_function_definitions(&engine, "this is not a program {{{").is_empty());
}

#[test]
fn test_comment_only_source_yields_empty_list() {
    let engine = Engine::new();
    assert!(extract_function_definitions(&engine, "// nothing").is_empty());
}

// Multiple top-level functions are all discovered, in source order, with
// their doc comments; nested functions are ignored.
#[test]
fn test_multiple_top_level_functions() {
    let engine = Engine::new();
    let src = "\
/// Adds two numbers.
fn add(a, b) {
    a + b
}

/// Runs add over a pair and wraps the result.
fn add_pair(pair) {
    let helper = |x| x;
    add(helper.call(pair[0]), pair[1])
}";

    let defs = extract_function_definitions(&engine, src);
    assert_eq!(defs.len(), 2);
    assert_eq!(defs[0].script_name, "add");
    assert_eq!(defs[0].args, vec!["a".to_string(), "b".to_string()]);
    assert_eq!(defs[0].docstring, "Adds two numbers.");
    assert_eq!(defs[1].script_name, "add_pair");
    assert!(defs[1].code.starts_with("/// Runs add"));
    assert!(defs[1].code.ends_with("}"));
}

#[test]
fn test_function_without_docstring() {
    let engine = Engine::new();
    let defs = extract_function_definitions(&engine, "fn silent(x) { x }");
    assert_eq!(defs.len(), 1);
    assert_eq!(defs[0].docstring, "");
    assert_eq!(defs[0].code, "fn silent(x) { x }");
}

// Braces inside strings do not confuse the span scanner.
#[test]
fn test_braces_in_strings_do_not_skew_spans() {
    let engine = Engine::new();
    let src = "/// Says braces.\nfn braces() {\n    \"{ not a block }\"\n}";
    let defs = extract_function_definitions(&engine, src);
    assert_eq!(defs.len(), 1);
    assert!(defs[0].code.ends_with("}"));
}

// The addendum lands in both the docstring and the source span, and the
// result still parses to the same function.
#[test]
fn test_docstring_addendum_round_trip() {
    let engine = Engine::new();
    let def = extract_function_definitions(&engine, DOUBLER_SRC)
        .into_iter()
        .next()
        .unwrap();

    let annotated = with_docstring_addendum(&def, 11);
    assert!(annotated.docstring.ends_with("message id 11."));
    assert!(annotated.code.contains("/// This function was generated"));

    let reparsed = extract_function_definitions(&engine, &annotated.code);
    assert_eq!(reparsed.len(), 1);
    assert_eq!(reparsed[0].script_name, "doubler");
    assert_eq!(reparsed[0].docstring, annotated.docstring);
}

#[test]
fn test_addendum_on_undocumented_function() {
    let engine = Engine::new();
    let def = extract_function_definitions(&engine, "fn silent(x) { x }")
        .into_iter()
        .next()
        .unwrap();

    let annotated = with_docstring_addendum(&def, 4);
    assert!(annotated.docstring.starts_with("This function was generated"));
    assert!(annotated.code.starts_with("/// This function was generated"));
}

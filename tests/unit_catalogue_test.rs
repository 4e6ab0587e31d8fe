use frankenrouter::core::catalogue::{NetworkMode, VariableCatalogue};

const GOOD_DATA: &str = r#"
[Aerowinx Precision Simulator - Variables]
[Version 10.180]

[Qs Types (strings)]
Qs0="CfgRego"; Mode=ECON; Min=0; Max=8;
Qs1="CfgSelcal"; Mode=ECON; Min=0; Max=8;
Qs121="PiBaHeAlTas"; Mode=ECON; Min=10; Max=200;
Qs468="FansDnResp"; Mode=DELTA; Min=0; Max=500;
Qs493="DestRwy"; Mode=START; Min=0; Max=3;
Qs411="CduRteCa"; Mode=ECON; Min=15; Max=50000;
Qi208="StartTimeRef"; Mode=START; Min=0; Max=2;
Qi214="GroundSpeed"; Mode=START; Min=0; Max=2;
"#;

#[test]
fn parses_valid_data() {
    let cat = VariableCatalogue::from_data(GOOD_DATA).unwrap();
    assert_eq!(cat.len(), 8);
    assert_eq!(cat.mode_of("Qs0"), Some(NetworkMode::Econ));
    assert_eq!(cat.mode_of("Qs468"), Some(NetworkMode::Delta));
    assert_eq!(cat.mode_of("Nope"), None);
    let def = cat.get("Qs121").unwrap();
    assert_eq!(def.name, "PiBaHeAlTas");
    assert_eq!(def.min, 10);
    assert_eq!(def.max, 200);
}

#[test]
fn declared_order_is_retained() {
    let cat = VariableCatalogue::from_data(GOOD_DATA).unwrap();
    assert_eq!(cat.declared_index("Qs0"), Some(0));
    assert_eq!(cat.declared_index("Qs121"), Some(2));
    // Qs411 comes before Qi208 because the file says so, numeric order be
    // damned.
    assert!(cat.declared_index("Qs411").unwrap() < cat.declared_index("Qi208").unwrap());
}

#[test]
fn delta_and_start_classification() {
    let cat = VariableCatalogue::from_data(GOOD_DATA).unwrap();
    assert!(cat.is_pure_delta("Qs468"));
    assert!(!cat.is_pure_delta("Qs0"));
    // Qs493 and Qi208 are START but also behave as ECON, so they are not
    // pure-START. Qi214 is.
    assert!(!cat.is_pure_start("Qs493"));
    assert!(!cat.is_pure_start("Qi208"));
    assert!(cat.is_pure_start("Qi214"));
    assert_eq!(cat.pure_start_keywords(), vec!["Qi214"]);
}

#[test]
fn rejects_missing_mode() {
    let data = r#"
Qs36="P62H"; Mode=ECON; Min=9; Max=9;
Qs37="P62J"; Min=9; Max=9;
"#;
    assert!(VariableCatalogue::from_data(data).is_err());
}

#[test]
fn rejects_duplicates_and_garbage() {
    let dup = r#"
Qs36="P62H"; Mode=ECON; Min=9; Max=9;
Qs36="P62H"; Mode=ECON; Min=9; Max=9;
"#;
    assert!(VariableCatalogue::from_data(dup).is_err());
    assert!(VariableCatalogue::from_data("INVALID FILE\n").is_err());
}

#[test]
fn psx_keyword_check() {
    let cat = VariableCatalogue::from_data(GOOD_DATA).unwrap();
    assert!(cat.is_psx_keyword("Qs123"));
    assert!(cat.is_psx_keyword("Qi1"));
    assert!(cat.is_psx_keyword("Lh42"));
    assert!(cat.is_psx_keyword("demand"));
    assert!(cat.is_psx_keyword("pleaseBeSoKindAndQuit"));
    assert!(!cat.is_psx_keyword("Gurka"));
    assert!(!cat.is_psx_keyword("Q"));
}

#[test]
fn numeric_keyword_sort() {
    let cat = VariableCatalogue::from_data(GOOD_DATA).unwrap();
    let mut keys = vec![
        "Qs100".to_string(),
        "Qs1".to_string(),
        "Qi9".to_string(),
        "Qs42".to_string(),
    ];
    cat.sort_psx_keywords(&mut keys);
    assert_eq!(keys, vec!["Qi9", "Qs1", "Qs42", "Qs100"]);
}

#[test]
fn nolong_set_is_marked() {
    let data = r#"
Qs375="AcarsRoute1"; Mode=ECON; Min=0; Max=50000;
Qs376="AcarsRoute2"; Mode=ECON; Min=0; Max=50000;
Qs5="Other"; Mode=ECON; Min=0; Max=8;
"#;
    let cat = VariableCatalogue::from_data(data).unwrap();
    assert!(cat.get("Qs375").unwrap().nolong);
    assert!(cat.get("Qs376").unwrap().nolong);
    assert!(!cat.get("Qs5").unwrap().nolong);
}

use stagecraft::contract::{
    ContractEntry, ContractError, ContractViolation, Environment, EnvironmentContract,
};

fn env(pairs: &[(&str, &str)]) -> Environment {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect()
}

fn dataprep_contract() -> EnvironmentContract {
    EnvironmentContract::new([
        ContractEntry::equals("MODE", "dataprep"),
        ContractEntry::equals("STORAGE_S3_SECRET", "sometoken"),
        ContractEntry::equals("S3_BUCKET", "mybucket"),
    ])
    .expect("valid contract")
}

#[test]
fn matching_environment_satisfies_contract() {
    let actual = env(&[
        ("MODE", "dataprep"),
        ("STORAGE_S3_SECRET", "sometoken"),
        ("S3_BUCKET", "mybucket"),
        ("PATH", "/usr/bin"),
    ]);
    assert_eq!(dataprep_contract().verify(&actual), Ok(()));
}

#[test]
fn wrong_mode_is_a_value_mismatch() {
    let contract = EnvironmentContract::new([ContractEntry::equals("MODE", "training")]).unwrap();
    let err = contract.verify(&env(&[("MODE", "save")])).unwrap_err();
    assert_eq!(
        err,
        ContractViolation::ValueMismatch {
            key: "MODE".into(),
            expected: "training".into(),
            actual: "save".into(),
        }
    );
    assert!(err.to_string().contains("expected 'training' but found 'save'"));
}

#[test]
fn empty_value_counts_as_missing() {
    let contract = EnvironmentContract::new([ContractEntry::presence("S3_BUCKET")]).unwrap();
    assert_eq!(
        contract.verify(&env(&[("S3_BUCKET", "")])),
        Err(ContractViolation::MissingKey {
            key: "S3_BUCKET".into()
        })
    );
    assert!(contract.verify(&env(&[("S3_BUCKET", "mybucket")])).is_ok());
}

#[test]
fn verify_reports_first_violation_in_declaration_order() {
    let actual = env(&[("MODE", "training")]);
    let err = dataprep_contract().verify(&actual).unwrap_err();
    assert_eq!(err.key(), "MODE");

    let all = dataprep_contract().violations(&actual);
    let keys: Vec<_> = all.iter().map(ContractViolation::key).collect();
    assert_eq!(keys, ["MODE", "STORAGE_S3_SECRET", "S3_BUCKET"]);
}

#[test]
fn verification_is_idempotent() {
    let contract = dataprep_contract();
    let actual = env(&[("MODE", "dataprep"), ("S3_BUCKET", "other")]);
    let first = contract.verify(&actual);
    let second = contract.verify(&actual);
    assert_eq!(first, second);
    assert!(first.is_err());
}

#[test]
fn empty_contract_accepts_any_environment() {
    let contract = EnvironmentContract::default();
    assert!(contract.verify(&Environment::new()).is_ok());
    assert!(contract.verify(&env(&[("ANYTHING", "x")])).is_ok());
}

#[test]
fn duplicate_keys_are_rejected_at_build_time() {
    let err = EnvironmentContract::new([
        ContractEntry::equals("MODE", "training"),
        ContractEntry::presence("MODE"),
    ])
    .unwrap_err();
    assert_eq!(err, ContractError::DuplicateKey("MODE".into()));
}

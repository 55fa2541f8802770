mod test_support;

use serde_json::json;
use test_support::{
    bootstrap_admin, create_student, login, read_response, request_err, request_ok,
    select_workspace, send, spawn_sidecar, temp_dir, ADMIN_USER,
};

#[test]
fn payment_reduces_balance_once_per_reference() {
    let workspace = temp_dir("registrar-payments");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    select_workspace(&mut stdin, &mut reader, &workspace);
    bootstrap_admin(&mut stdin, &mut reader);
    let student = create_student(&mut stdin, &mut reader, "amy", "S001", 200_000);

    let payment = |amount: serde_json::Value, reference: &str| {
        json!({
            "studentId": student,
            "amount": amount,
            "date": "2025-09-01",
            "method": "BANK",
            "referenceNumber": reference
        })
    };

    let res = request_ok(
        &mut stdin,
        &mut reader,
        "p1",
        "payments.record",
        payment(json!(50_000), "R1"),
    );
    assert_eq!(res["referenceNumber"], "R1");
    assert_eq!(res["feeBalance"], 150_000);

    let code = request_err(
        &mut stdin,
        &mut reader,
        "p2",
        "payments.record",
        payment(json!(10_000), "R1"),
    );
    assert_eq!(code, "duplicate_reference");

    let code = request_err(&mut stdin, &mut reader, "p3", "payments.record", payment(json!(0), "R2"));
    assert_eq!(code, "invalid_amount");
    let code = request_err(
        &mut stdin,
        &mut reader,
        "p4",
        "payments.record",
        payment(json!(12.5), "R3"),
    );
    assert_eq!(code, "invalid_amount");

    let balance = request_ok(
        &mut stdin,
        &mut reader,
        "bal",
        "payments.balance",
        json!({ "studentId": student }),
    );
    assert_eq!(balance["feeBalance"], 150_000);
    assert_eq!(balance["totalPaid"], 50_000);

    let found = request_ok(
        &mut stdin,
        &mut reader,
        "ref",
        "payments.getByReference",
        json!({ "referenceNumber": "R1" }),
    );
    assert_eq!(found["payment"]["amount"], 50_000);
    assert_eq!(found["payment"]["date"], "2025-09-01");

    // The student sees only their own ledger.
    let _ = login(&mut stdin, &mut reader, "amy");
    let history = request_ok(&mut stdin, &mut reader, "hist", "payments.history", json!({}));
    assert_eq!(history["payments"].as_array().map(|a| a.len()), Some(1));
    let code = request_err(
        &mut stdin,
        &mut reader,
        "rec",
        "payments.record",
        payment(json!(1_000), "R9"),
    );
    assert_eq!(code, "forbidden");
}

#[test]
fn generated_references_are_unique_and_prefixed() {
    let workspace = temp_dir("registrar-payments-ref");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    select_workspace(&mut stdin, &mut reader, &workspace);
    bootstrap_admin(&mut stdin, &mut reader);
    let student = create_student(&mut stdin, &mut reader, "ben", "S002", 30_000);

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "setup",
        "setup.update",
        json!({ "section": "payments", "patch": { "referencePrefix": "UNI" } }),
    );

    let mut refs = Vec::new();
    for i in 0..2 {
        let res = request_ok(
            &mut stdin,
            &mut reader,
            &format!("auto{}", i),
            "payments.record",
            json!({ "studentId": student, "amount": 10_000 }),
        );
        let reference = res["referenceNumber"].as_str().expect("reference").to_string();
        assert!(reference.starts_with("UNI-"), "{}", reference);
        refs.push(reference);
    }
    assert_ne!(refs[0], refs[1]);

    let total = request_ok(
        &mut stdin,
        &mut reader,
        "total",
        "payments.totalPaid",
        json!({ "studentId": student }),
    );
    assert_eq!(total["totalPaid"], 20_000);

    let code = request_err(
        &mut stdin,
        &mut reader,
        "ghost",
        "payments.record",
        json!({ "studentId": "no-such-student", "amount": 500, "referenceNumber": "G1" }),
    );
    assert_eq!(code, "student_not_found");
}

#[test]
fn oversized_payments_cannot_corrupt_the_balance() {
    let workspace = temp_dir("registrar-payments-overflow");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    select_workspace(&mut stdin, &mut reader, &workspace);
    bootstrap_admin(&mut stdin, &mut reader);
    let student = create_student(&mut stdin, &mut reader, "cal", "S003", 0);

    let res = request_ok(
        &mut stdin,
        &mut reader,
        "max",
        "payments.record",
        json!({ "studentId": student, "amount": i64::MAX, "referenceNumber": "MAX1" }),
    );
    assert_eq!(res["feeBalance"], -i64::MAX);

    let code = request_err(
        &mut stdin,
        &mut reader,
        "over",
        "payments.record",
        json!({ "studentId": student, "amount": 10, "referenceNumber": "MAX2" }),
    );
    assert_eq!(code, "invalid_amount");

    let balance = request_ok(
        &mut stdin,
        &mut reader,
        "bal",
        "payments.balance",
        json!({ "studentId": student }),
    );
    assert_eq!(balance["feeBalance"], -i64::MAX);
    assert_eq!(balance["totalPaid"], i64::MAX);

    // The student record is still readable, so signing in still works.
    let who = login(&mut stdin, &mut reader, "cal");
    assert_eq!(who["identity"]["role"]["feeBalance"], -i64::MAX);
}

#[test]
fn concurrent_payments_with_one_reference_apply_once() {
    let workspace = temp_dir("registrar-payments-race");
    let (_setup_child, mut stdin, mut reader) = spawn_sidecar();
    select_workspace(&mut stdin, &mut reader, &workspace);
    bootstrap_admin(&mut stdin, &mut reader);
    let student = create_student(&mut stdin, &mut reader, "dee", "S004", 100_000);

    let mut sidecars: Vec<_> = (0..2)
        .map(|_| {
            let (child, mut s_in, mut s_out) = spawn_sidecar();
            select_workspace(&mut s_in, &mut s_out, &workspace);
            let _ = login(&mut s_in, &mut s_out, ADMIN_USER);
            (child, s_in, s_out)
        })
        .collect();

    for (i, (_, s_in, _)) in sidecars.iter_mut().enumerate() {
        send(
            s_in,
            &format!("pay{}", i),
            "payments.record",
            json!({ "studentId": student, "amount": 25_000, "referenceNumber": "SHARED-1" }),
        );
    }
    let mut ok = 0;
    let mut dup = 0;
    for (i, (_, _, s_out)) in sidecars.iter_mut().enumerate() {
        let resp = read_response(s_out, &format!("pay{}", i));
        if resp["ok"].as_bool() == Some(true) {
            ok += 1;
        } else {
            assert_eq!(resp["error"]["code"], "duplicate_reference", "{}", resp);
            dup += 1;
        }
    }
    assert_eq!((ok, dup), (1, 1));

    let balance = request_ok(
        &mut stdin,
        &mut reader,
        "bal",
        "payments.balance",
        json!({ "studentId": student }),
    );
    assert_eq!(balance["feeBalance"], 75_000);
    assert_eq!(balance["totalPaid"], 25_000);
}

#[test]
fn whoami_reflects_payments_made_elsewhere() {
    let workspace = temp_dir("registrar-payments-whoami");
    let (_admin_child, mut stdin, mut reader) = spawn_sidecar();
    select_workspace(&mut stdin, &mut reader, &workspace);
    bootstrap_admin(&mut stdin, &mut reader);
    let student = create_student(&mut stdin, &mut reader, "eli", "S005", 40_000);

    let (_student_child, mut s_in, mut s_out) = spawn_sidecar();
    select_workspace(&mut s_in, &mut s_out, &workspace);
    let who = login(&mut s_in, &mut s_out, "eli");
    assert_eq!(who["identity"]["role"]["feeBalance"], 40_000);

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "pay",
        "payments.record",
        json!({ "studentId": student, "amount": 15_000, "referenceNumber": "W1" }),
    );

    let me = request_ok(&mut s_in, &mut s_out, "me", "auth.whoami", json!({}));
    assert_eq!(me["identity"]["role"]["feeBalance"], 25_000);
}

#![no_main]

use libfuzzer_sys::arbitrary::{Arbitrary, Unstructured};
use libfuzzer_sys::fuzz_target;
use pgpump::auth::ScramClient;

#[derive(Debug)]
struct ScramInput {
    username: String,
    password: String,
    server_first: String,
    server_final: String,
}

impl<'a> Arbitrary<'a> for ScramInput {
    fn arbitrary(u: &mut Unstructured<'a>) -> libfuzzer_sys::arbitrary::Result<Self> {
        Ok(Self {
            username: u.arbitrary()?,
            password: u.arbitrary()?,
            server_first: u.arbitrary()?,
            server_final: u.arbitrary()?,
        })
    }
}

fuzz_target!(|input: ScramInput| {
    // a fixed nonce lets the fuzzer find server-first messages that extend it
    let client = ScramClient::with_nonce(input.username, input.password, "fuzz");
    let _ = client.client_first();

    // keep PBKDF2 cheap
    let iterations = input
        .server_first
        .split(',')
        .filter_map(|attr| attr.strip_prefix("i="))
        .filter_map(|count| count.parse::<u32>().ok())
        .max();
    if iterations.is_some_and(|n| n > 64) {
        return;
    }

    if let Ok((_, state)) = client.client_final(&input.server_first) {
        let _ = client.verify_server_final(&input.server_final, &state);
    }
});

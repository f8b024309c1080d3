//! Property-based tests for the TXT challenge format and TXT wire encoding

use proptest::prelude::*;

use pdsdns::dns::buffer::{PacketBuffer, VectorPacketBuffer};
use pdsdns::dns::protocol::{DnsPacket, DnsQuestion, DnsRecord, QueryType};
use pdsdns::verification::challenge::{
    extract_verification_token, format_txt_record, ChallengeFormat, ExternalProvider,
};

// Tokens as the generator emits them: 32 bytes of lowercase hex
fn token_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-f0-9]{64}").unwrap()
}

// Printable ASCII, long enough to need several character-strings
fn txt_data_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[\\x20-\\x7E]{0,1200}").unwrap()
}

proptest! {
    #[test]
    fn prop_formatted_value_proves_its_token(token in token_strategy()) {
        let value = format_txt_record(&token);

        prop_assert!(ChallengeFormat::Native.matches(&value, &token));
        prop_assert_eq!(Some(token.clone()), extract_verification_token(&value));
    }

    #[test]
    fn prop_single_character_change_never_matches(
        token in token_strategy(),
        index in 0usize..64,
        replacement in prop::sample::select(vec!['0', '7', 'a', 'f', 'g', 'Z', ' ']),
    ) {
        prop_assume!(token.as_bytes()[index] as char != replacement);

        let mut mutated: Vec<char> = token.chars().collect();
        mutated[index] = replacement;
        let mutated: String = mutated.into_iter().collect();

        prop_assert!(!ChallengeFormat::Native.matches(&format_txt_record(&mutated), &token));
    }

    #[test]
    fn prop_other_entries_do_not_hide_the_token(
        token in token_strategy(),
        before in "[a-z=]{1,20}",
        after in "[a-z=]{1,20}",
    ) {
        let value = format!("{} {} {}", before, format_txt_record(&token), after);
        prop_assert!(ChallengeFormat::Native.matches(&value, &token));

        // a prefix glued to the value is not an exact entry
        let glued = format!("{}{}", before, format_txt_record(&token));
        prop_assert!(!ChallengeFormat::Native.matches(&glued, &token));
    }

    #[test]
    fn prop_provider_formats_do_not_cross(token in token_strategy()) {
        let external = ChallengeFormat::External(ExternalProvider::OneLogin);

        prop_assert!(!external.matches(&format_txt_record(&token), &token));
        prop_assert!(!ChallengeFormat::Native.matches(&external.format(&token), &token));
    }

    #[test]
    fn prop_txt_data_survives_the_wire(data in txt_data_strategy(), ttl in 0u32..=i32::MAX as u32) {
        let mut packet = DnsPacket::new();
        packet.header.id = 4711;
        packet.header.response = true;
        packet
            .questions
            .push(DnsQuestion::new("_pds-verify.example.com".to_string(), QueryType::Txt));
        packet.answers.push(DnsRecord::Txt {
            domain: "_pds-verify.example.com".to_string(),
            data: data.clone(),
            ttl,
        });

        let mut buffer = VectorPacketBuffer::new();
        packet.write(&mut buffer, 0xFFFF).unwrap();
        buffer.seek(0).unwrap();

        let parsed = DnsPacket::from_buffer(&mut buffer).unwrap();
        prop_assert_eq!(vec![data], parsed.txt_answers("_pds-verify.example.com"));
        prop_assert_eq!(ttl, parsed.answers[0].get_ttl());
    }
}

/* STATIC Proxy (AGPL-3.0)

Copyright (C) 2025 - 404 Contributors

This program is free software: you can redistribute it and/or modify
it under the terms of the GNU Affero General Public License as published by
the Free Software Foundation, either version 3 of the License, or
(at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU Affero General Public License for more details.

You should have received a copy of the GNU Affero General Public License
along with this program.  If not, see <https://www.gnu.org/licenses/>.

*/


use intercept_proxy::hpack::{table::entry_size, DynamicTable, HpackDecoder};
use intercept_proxy::http::HeaderField;
use proptest::prelude::*;

fn hex(raw: &str) -> Vec<u8> {
    let digits: Vec<u8> = raw.bytes().filter(u8::is_ascii_hexdigit).collect();
    digits
        .chunks(2)
        .map(|pair| {
            let text = std::str::from_utf8(pair).expect("ascii");
            u8::from_str_radix(text, 16).expect("hex pair")
        })
        .collect()
}

fn pairs(fields: &[HeaderField]) -> Vec<(String, String)> {
    fields
        .iter()
        .map(|field| {
            (
                field.name.clone(),
                field.value_str().expect("utf-8 value").to_string(),
            )
        })
        .collect()
}

fn expect(list: &[(&str, &str)]) -> Vec<(String, String)> {
    list.iter()
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect()
}

#[test]
fn response_sequence_evicts_oldest_entries() {
    // RFC 7541 C.5: three responses through a 256-byte table.
    let mut decoder = HpackDecoder::with_max_table_size(256);

    let first = decoder
        .decode(&hex(
            "4803 3330 3258 0770 7269 7661 7465 611d
             4d6f 6e2c 2032 3120 4f63 7420 3230 3133
             2032 303a 3133 3a32 3120 474d 546e 1768
             7474 7073 3a2f 2f77 7777 2e65 7861 6d70
             6c65 2e63 6f6d",
        ))
        .expect("first response");
    assert_eq!(
        pairs(&first),
        expect(&[
            (":status", "302"),
            ("cache-control", "private"),
            ("date", "Mon, 21 Oct 2013 20:13:21 GMT"),
            ("location", "https://www.example.com"),
        ])
    );
    assert_eq!(decoder.dynamic_table().size(), 222);

    let second = decoder
        .decode(&hex("4803 3330 37c1 c0bf"))
        .expect("second response");
    assert_eq!(pairs(&second)[0], (":status".to_string(), "307".to_string()));
    assert_eq!(pairs(&second)[3].1, "https://www.example.com");
    assert_eq!(decoder.dynamic_table().size(), 222);
    assert_eq!(decoder.dynamic_table().len(), 4);

    let third = decoder
        .decode(&hex(
            "88c1 611d 4d6f 6e2c 2032 3120 4f63 7420
             3230 3133 2032 303a 3133 3a32 3220 474d
             54c0 5a04 677a 6970 7738 666f 6f3d 4153
             444a 4b48 514b 425a 584f 5157 454f 5049
             5541 5851 5745 4f49 553b 206d 6178 2d61
             6765 3d33 3630 303b 2076 6572 7369 6f6e
             3d31",
        ))
        .expect("third response");
    assert_eq!(
        pairs(&third),
        expect(&[
            (":status", "200"),
            ("cache-control", "private"),
            ("date", "Mon, 21 Oct 2013 20:13:22 GMT"),
            ("location", "https://www.example.com"),
            ("content-encoding", "gzip"),
            (
                "set-cookie",
                "foo=ASDJKHQKBZXOQWEOPIUAXQWEOIU; max-age=3600; version=1"
            ),
        ])
    );

    let table = decoder.dynamic_table();
    assert_eq!(table.size(), 215);
    let names: Vec<&str> = table.iter().map(|field| field.name.as_str()).collect();
    assert_eq!(names, vec!["set-cookie", "content-encoding", "date"]);
}

#[test]
fn shrinking_the_setting_evicts_immediately() {
    let mut decoder = HpackDecoder::new();
    decoder
        .decode(&hex("400a 6375 7374 6f6d 2d6b 6579 0d63 7573 746f 6d2d 6865 6164 6572"))
        .expect("literal with indexing");
    assert_eq!(decoder.dynamic_table().size(), 55);

    decoder.set_max_allowed(40);
    assert!(decoder.dynamic_table().is_empty());
    assert_eq!(decoder.dynamic_table().max_size(), 40);
}

#[derive(Debug, Clone)]
enum TableOp {
    Insert(String, String),
    Resize(usize),
}

fn table_op() -> impl Strategy<Value = TableOp> {
    prop_oneof![
        4 => ("[a-z-]{1,16}", "[ -~]{0,48}").prop_map(|(name, value)| TableOp::Insert(name, value)),
        1 => (0usize..400).prop_map(TableOp::Resize),
    ]
}

proptest! {
    #[test]
    fn table_stays_within_bound_and_evicts_oldest_first(
        initial in 0usize..400,
        ops in prop::collection::vec(table_op(), 1..64),
    ) {
        let mut table = DynamicTable::new(initial);
        // Everything inserted since the table was last emptied, newest first.
        let mut history: Vec<HeaderField> = Vec::new();

        for op in ops {
            match op {
                TableOp::Insert(name, value) => {
                    let field = HeaderField::new(name, value);
                    let fits = entry_size(&field) <= table.max_size();
                    table.insert(field.clone());
                    if fits {
                        history.insert(0, field.clone());
                        prop_assert_eq!(table.get(0), Some(&field));
                    } else {
                        history.clear();
                        prop_assert!(table.is_empty());
                    }
                }
                TableOp::Resize(max) => table.set_max_size(max),
            }

            prop_assert!(table.size() <= table.max_size());
            let accounted: usize = table.iter().map(entry_size).sum();
            prop_assert_eq!(table.size(), accounted);

            let kept: Vec<&HeaderField> = table.iter().collect();
            let newest: Vec<&HeaderField> = history.iter().take(kept.len()).collect();
            prop_assert_eq!(kept, newest);
        }
    }
}

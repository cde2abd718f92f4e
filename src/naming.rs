//! Column name / property name mapping
//!
//! Columns use underscore form (`big_string`), properties use camel form
//! (`bigString`). The two conversions are exact inverses for valid
//! identifiers: lowercase-start names whose words are separated by a single
//! underscore or a capital letter.

/// Convert a column name to property form: `big_string` => `bigString`
pub fn property_name_for_column(column_name: &str) -> String {
    let mut out = String::with_capacity(column_name.len());
    let mut upper_next = false;
    for ch in column_name.chars() {
        if ch == '_' {
            upper_next = true;
        } else if upper_next {
            out.extend(ch.to_uppercase());
            upper_next = false;
        } else {
            out.push(ch);
        }
    }
    out
}

/// Convert a property name to column form: `bigString` => `big_string`
pub fn column_name_for_property(property_name: &str) -> String {
    let mut out = String::with_capacity(property_name.len() + 4);
    for ch in property_name.chars() {
        if ch.is_uppercase() {
            out.push('_');
            out.extend(ch.to_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

/// Key used for a column in dictionary representations (the column form)
pub fn dictionary_key_for_column(column_name: &str) -> String {
    column_name.to_string()
}

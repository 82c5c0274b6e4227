use cpw_core::{normalize, NO_PRICE};
use cpw_sources::{
    parse_display_products, parse_reco_page, parse_sigls_ids, parse_storefront_html, Cursor,
};
use cpw_storage::Url;

const RECO_PAGE_1: &[u8] = include_bytes!("../../../fixtures/reco/page-1.json");
const RECO_LAST_PAGE: &[u8] = include_bytes!("../../../fixtures/reco/last-page.json");
const SIGLS: &[u8] = include_bytes!("../../../fixtures/gamepass/sigls.json");
const PRODUCTS: &[u8] = include_bytes!("../../../fixtures/gamepass/products.json");
const ALL_GAMES: &str = include_str!("../../../fixtures/storefront/all-games.html");
const EMBEDDED_ONLY: &str = include_str!("../../../fixtures/storefront/embedded-only.html");

fn listing_url() -> Url {
    Url::parse("https://www.xbox.com/es-AR/games/all-games/pc?PlayWith=PC").unwrap()
}

#[test]
fn reco_page_parses_items_and_next_offset() {
    let page = parse_reco_page(RECO_PAGE_1, 0, 3).unwrap();
    assert_eq!(page.items.len(), 3);
    assert_eq!(page.next, Some(Cursor::Offset(3)));

    let records: Vec<_> = page
        .items
        .iter()
        .enumerate()
        .map(|(i, raw)| normalize(raw, || format!("reco:{i}")))
        .collect();
    assert_eq!(records[0].id, "9NBLGGH4R315");
    assert_eq!(records[0].price, "ARS 1999.99");
    assert_eq!(records[1].price, "0");
    assert_eq!(records[2].name, "Untitled");
    assert_eq!(records[2].price, NO_PRICE);
    assert_eq!(records[2].link, "#");
}

#[test]
fn reco_short_page_ends_listing() {
    let page = parse_reco_page(RECO_PAGE_1, 0, 100).unwrap();
    assert_eq!(page.next, None);
}

#[test]
fn reco_total_ends_listing_even_on_full_page() {
    let page = parse_reco_page(RECO_LAST_PAGE, 200, 1).unwrap();
    assert_eq!(page.items.len(), 1);
    assert_eq!(page.next, None);
}

#[test]
fn sigls_skips_header_blank_and_duplicate_ids() {
    let ids = parse_sigls_ids(SIGLS, 50).unwrap();
    assert_eq!(ids, vec!["9NBLGGH4R315", "9PNJXVCVWD4K", "BQ1W1T1FC14W"]);
}

#[test]
fn display_products_keep_pc_titles_only() {
    let items = parse_display_products(PRODUCTS, "es-AR").unwrap();
    let ids: Vec<_> = items.iter().filter_map(|i| i.id.as_deref()).collect();
    assert_eq!(ids, vec!["9NBLGGH4R315", "9PNJXVCVWD4K"]);

    let forza = normalize(&items[0], || unreachable!());
    assert_eq!(forza.name, "Forza Horizon 5");
    assert_eq!(forza.price, "ARS 1999.99");
    assert_eq!(forza.link, "https://www.xbox.com/es-AR/games/store/_/9NBLGGH4R315");

    let halo = normalize(&items[1], || unreachable!());
    assert_eq!(halo.name, "Halo Infinite");
    assert_eq!(halo.price, NO_PRICE);
}

#[test]
fn storefront_cards_then_embedded_ids() {
    let items = parse_storefront_html(ALL_GAMES, &listing_url(), "es-AR").unwrap();
    let ids: Vec<_> = items.iter().filter_map(|i| i.id.as_deref()).collect();
    assert_eq!(ids, vec!["9NBLGGH4R315", "9PNJXVCVWD4K", "9NKX70BBCDRN"]);

    let forza = normalize(&items[0], || unreachable!());
    assert_eq!(forza.name, "Forza Horizon 5");
    assert_eq!(forza.price, "ARS$ 1.999,99");
    assert_eq!(
        forza.link,
        "https://www.xbox.com/es-AR/games/store/forza-horizon-5/9NBLGGH4R315"
    );

    let halo = normalize(&items[1], || unreachable!());
    assert_eq!(halo.name, "Halo Infinite");
    assert_eq!(halo.price, NO_PRICE);

    let embedded = normalize(&items[2], || unreachable!());
    assert_eq!(embedded.name, "Untitled");
    assert_eq!(
        embedded.link,
        "https://www.xbox.com/es-AR/games/store/_/9NKX70BBCDRN"
    );
}

#[test]
fn storefront_falls_back_to_embedded_state() {
    let items = parse_storefront_html(EMBEDDED_ONLY, &listing_url(), "es-AR").unwrap();
    let ids: Vec<_> = items.iter().filter_map(|i| i.id.as_deref()).collect();
    assert_eq!(ids, vec!["9NKX70BBCDRN", "9MZ11KT5KLP6"]);
}

#[test]
fn storefront_without_products_is_empty() {
    let items = parse_storefront_html("<html><body></body></html>", &listing_url(), "es-AR").unwrap();
    assert!(items.is_empty());
}

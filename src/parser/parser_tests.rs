#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::geo::GeoResolver;
    use crate::parser::{
        IncomingMessage, OrderExtractor, canonical_group_id, detect_region, extract_locations,
        extract_price, is_closed_order, is_order_message, telegram_link,
    };

    fn message(text: &str) -> IncomingMessage {
        IncomingMessage {
            chat_id: -1001234567890,
            chat_title: Some("Межгород Урал".into()),
            chat_username: None,
            message_id: 42,
            text: text.into(),
            author_id: Some(777),
            author_username: Some("driver_mate".into()),
            author_first_name: Some("Ринат".into()),
        }
    }

    fn extractor() -> OrderExtractor {
        OrderExtractor::new(Arc::new(GeoResolver::offline()), None)
    }

    // ── gate ────────────────────────────────────────────────────────────

    #[test]
    fn empty_text_is_not_an_order() {
        assert!(!is_order_message(""));
    }

    #[test]
    fn keyword_passes_gate() {
        assert!(is_order_message("Нужен водитель на завтра"));
    }

    #[test]
    fn dash_route_passes_gate_without_keywords() {
        assert!(is_order_message("Екатеринбург - Челябинск, 3500 руб, 2 человека"));
    }

    #[test]
    fn labeled_points_pass_gate() {
        assert!(is_order_message("А: Уфа Б: Казань 15к"));
    }

    #[test]
    fn plain_chatter_fails_gate() {
        assert!(!is_order_message("Всем привет, как дела?"));
    }

    #[test]
    fn closed_markers_reject_outright() {
        assert!(is_closed_order("Заказ выполнен, больше не актуально"));
        assert!(is_closed_order("ЗАКРЫТО"));
        assert!(is_closed_order("машина найдена, спасибо"));
        assert!(!is_order_message("Заказ выполнен, больше не актуально"));
    }

    // ── location extraction ─────────────────────────────────────────────

    #[test]
    fn dash_separated_known_cities() {
        let (a, b) = extract_locations("Екатеринбург - Челябинск, 3500 руб, 2 человека")
            .expect("route");
        assert_eq!(a, "Екатеринбург");
        assert_eq!(b, "Челябинск");
    }

    #[test]
    fn labeled_points_inline() {
        let (a, b) = extract_locations("А: Уфа Б: Казань 15к").expect("route");
        assert_eq!(a, "Уфа");
        assert_eq!(b, "Казань");
    }

    #[test]
    fn labeled_points_on_separate_lines() {
        let text = "Заказ на сегодня\nА: Магнитогорск\nБ: Челябинск\n4 места";
        let (a, b) = extract_locations(text).expect("route");
        assert_eq!(a, "Магнитогорск");
        assert_eq!(b, "Челябинск");
    }

    #[test]
    fn preposition_pattern_normalizes_declension() {
        let (a, b) = extract_locations("Ищу машину из Уфы в Казань на завтра").expect("route");
        assert_eq!(a, "Уфа");
        assert_eq!(b, "Казань");
    }

    #[test]
    fn aliases_resolve_to_canonical_names() {
        let (a, b) = extract_locations("екб - челяба, 3000р").expect("route");
        assert_eq!(a, "Екатеринбург");
        assert_eq!(b, "Челябинск");
    }

    #[test]
    fn position_scan_keeps_text_order() {
        let (a, b) = extract_locations("Свободна машина, еду Казань потом Уфа вечером")
            .expect("route");
        assert_eq!(a, "Казань");
        assert_eq!(b, "Уфа");
    }

    #[test]
    fn longest_city_name_wins_over_substring() {
        let (a, b) = extract_locations("Набережные Челны → Нижнекамск, заказ").expect("route");
        assert_eq!(a, "Набережные Челны");
        assert_eq!(b, "Нижнекамск");
    }

    #[test]
    fn typo_in_city_is_fuzzy_matched() {
        let (a, b) = extract_locations("Екатеренбург - Челябинск, поездка").expect("route");
        assert_eq!(a, "Екатеринбург");
        assert_eq!(b, "Челябинск");
    }

    #[test]
    fn street_address_side_is_rejected() {
        assert!(extract_locations("улица Ленина - Казань, заказ").is_none());
    }

    #[test]
    fn single_city_is_not_a_route() {
        assert!(extract_locations("Нужна машина по Казани на вечер").is_none());
    }

    // ── price extraction ────────────────────────────────────────────────

    #[test]
    fn price_with_currency_word() {
        assert_eq!(extract_price("Екатеринбург - Челябинск, 3500 руб"), Some(3500));
    }

    #[test]
    fn price_with_thousands_suffix() {
        assert_eq!(extract_price("А: Уфа Б: Казань 15к"), Some(15_000));
        assert_eq!(extract_price("Цена 7 тыс"), Some(7_000));
    }

    #[test]
    fn comma_grouped_price_takes_priority() {
        assert_eq!(extract_price("2,500 руб или договоримся на 3000"), Some(2500));
    }

    #[test]
    fn bare_four_digit_number_is_a_price() {
        assert_eq!(extract_price("Уфа Казань 4500 завтра утром"), Some(4500));
    }

    #[test]
    fn phone_number_digits_are_not_a_price() {
        assert_eq!(extract_price("Уфа Казань, звоните 8-917-123-45-67"), None);
    }

    #[test]
    fn clock_time_is_not_a_price() {
        assert_eq!(extract_price("Выезд в 14:30, Уфа Казань"), None);
    }

    #[test]
    fn date_digits_are_not_a_price() {
        assert_eq!(extract_price("Поездка 25.12.2026, Уфа Казань"), None);
    }

    #[test]
    fn out_of_bounds_prices_are_dropped() {
        assert_eq!(extract_price("довезу за 200 руб"), None);
        assert_eq!(extract_price("квартира за 900к"), None);
    }

    // ── region / links ──────────────────────────────────────────────────

    #[test]
    fn region_detected_from_cities() {
        assert_eq!(detect_region("", "Екатеринбург", "Челябинск"), Some("ural"));
        assert_eq!(detect_region("", "Уфа", "Казань"), Some("povolzhye"));
        assert_eq!(detect_region("", "Лондон", "Париж"), None);
    }

    #[test]
    fn public_chat_links_by_username() {
        assert_eq!(
            telegram_link(123, 55, Some("ural_taxi")),
            "https://t.me/ural_taxi/55"
        );
    }

    #[test]
    fn private_chat_links_strip_supergroup_marker() {
        assert_eq!(
            telegram_link(-1001234567890, 55, None),
            "https://t.me/c/1234567890/55"
        );
    }

    #[test]
    fn group_ids_canonicalize_to_bare_positive() {
        assert_eq!(canonical_group_id(-1001234567890), 1234567890);
        assert_eq!(canonical_group_id(-234567890), 234567890);
        assert_eq!(canonical_group_id(234567890), 234567890);
    }

    // ── full pipeline ───────────────────────────────────────────────────

    #[tokio::test]
    async fn dash_order_extracts_end_to_end() {
        let order = extractor()
            .extract(&message("Екатеринбург - Челябинск, 3500 руб, 2 человека"))
            .await
            .expect("order");
        assert_eq!(order.point_a, "Екатеринбург");
        assert_eq!(order.point_b, "Челябинск");
        assert_eq!(order.price, Some(3500));
        assert_eq!(order.source_group_id, 1234567890);
        assert_eq!(order.source_link, "https://t.me/c/1234567890/42");
        assert!(order.point_a_coords.is_some());
        assert!(order.point_b_coords.is_some());
        assert_eq!(order.region, Some("ural"));
    }

    #[tokio::test]
    async fn labeled_order_extracts_end_to_end() {
        let order = extractor()
            .extract(&message("А: Уфа Б: Казань 15к"))
            .await
            .expect("order");
        assert_eq!(order.point_a, "Уфа");
        assert_eq!(order.point_b, "Казань");
        assert_eq!(order.price, Some(15_000));
    }

    #[tokio::test]
    async fn closed_order_is_dropped() {
        assert!(
            extractor()
                .extract(&message("Уфа - Казань, заказ выполнен"))
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn stoplisted_word_is_not_a_city() {
        assert!(
            extractor()
                .extract(&message("Трансфер - Казань завтра, 5000 руб"))
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn order_without_price_still_extracts() {
        let order = extractor()
            .extract(&message("Кто повезёт из Уфы в Казань?"))
            .await
            .expect("order");
        assert_eq!(order.price, None);
    }

    #[tokio::test]
    async fn validator_rejects_short_and_numeric_names() {
        let ex = extractor();
        assert!(!ex.is_valid_city("Уф").await);
        assert!(!ex.is_valid_city("123").await);
        assert!(!ex.is_valid_city("трансфер").await);
        assert!(ex.is_valid_city("Казань").await);
    }
}

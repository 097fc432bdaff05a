//! City dictionaries and domain word lists for order extraction.
//!
//! All entries are lowercase; callers lowercase the message text before
//! matching. `KNOWN_CITIES` keeps the canonical (display) form.

/// Canonical city names, the form notifications display.
pub const KNOWN_CITIES: &[&str] = &[
    "Москва",
    "Санкт-Петербург",
    "Екатеринбург",
    "Челябинск",
    "Магнитогорск",
    "Златоуст",
    "Миасс",
    "Копейск",
    "Троицк",
    "Тюмень",
    "Курган",
    "Пермь",
    "Уфа",
    "Стерлитамак",
    "Салават",
    "Октябрьский",
    "Нефтекамск",
    "Белорецк",
    "Сибай",
    "Казань",
    "Набережные Челны",
    "Нижнекамск",
    "Альметьевск",
    "Елабуга",
    "Зеленодольск",
    "Чебоксары",
    "Йошкар-Ола",
    "Ижевск",
    "Киров",
    "Нижний Новгород",
    "Самара",
    "Тольятти",
    "Сызрань",
    "Ульяновск",
    "Саратов",
    "Пенза",
    "Оренбург",
    "Орск",
    "Бузулук",
    "Новосибирск",
    "Омск",
    "Томск",
    "Кемерово",
    "Новокузнецк",
    "Барнаул",
    "Бийск",
    "Горно-Алтайск",
    "Красноярск",
    "Абакан",
    "Иркутск",
    "Ростов-на-Дону",
    "Краснодар",
    "Сочи",
    "Новороссийск",
    "Анапа",
    "Геленджик",
    "Ставрополь",
    "Пятигорск",
    "Кисловодск",
    "Минеральные Воды",
    "Волгоград",
    "Воронеж",
    "Белгород",
    "Курск",
    "Тула",
    "Тверь",
    "Ярославль",
    "Владимир",
    "Рязань",
    "Смоленск",
];

/// Abbreviations and colloquial names → canonical form.
pub const CITY_ALIASES: &[(&str, &str)] = &[
    ("мск", "Москва"),
    ("спб", "Санкт-Петербург"),
    ("питер", "Санкт-Петербург"),
    ("петербург", "Санкт-Петербург"),
    ("екб", "Екатеринбург"),
    ("екат", "Екатеринбург"),
    ("ёбург", "Екатеринбург"),
    ("челяба", "Челябинск"),
    ("мгн", "Магнитогорск"),
    ("челны", "Набережные Челны"),
    ("н.челны", "Набережные Челны"),
    ("ростов", "Ростов-на-Дону"),
    ("минводы", "Минеральные Воды"),
];

/// Declined forms of frequent cities → nominative. The preposition pattern
/// ("из Уфы в Казань") produces these.
pub const CITY_DECLENSIONS: &[(&str, &str)] = &[
    ("москвы", "Москва"),
    ("москву", "Москва"),
    ("москве", "Москва"),
    ("уфы", "Уфа"),
    ("уфу", "Уфа"),
    ("уфе", "Уфа"),
    ("казани", "Казань"),
    ("екатеринбурга", "Екатеринбург"),
    ("екатеринбурге", "Екатеринбург"),
    ("челябинска", "Челябинск"),
    ("челябинске", "Челябинск"),
    ("магнитогорска", "Магнитогорск"),
    ("магнитогорске", "Магнитогорск"),
    ("златоуста", "Златоуст"),
    ("миасса", "Миасс"),
    ("тюмени", "Тюмень"),
    ("кургана", "Курган"),
    ("перми", "Пермь"),
    ("стерлитамака", "Стерлитамак"),
    ("салавата", "Салават"),
    ("самары", "Самара"),
    ("самару", "Самара"),
    ("самаре", "Самара"),
    ("тольятти", "Тольятти"),
    ("ульяновска", "Ульяновск"),
    ("саратова", "Саратов"),
    ("пензы", "Пенза"),
    ("оренбурга", "Оренбург"),
    ("ижевска", "Ижевск"),
    ("кирова", "Киров"),
    ("чебоксар", "Чебоксары"),
    ("челнов", "Набережные Челны"),
    ("нижнекамска", "Нижнекамск"),
    ("альметьевска", "Альметьевск"),
    ("новосибирска", "Новосибирск"),
    ("омска", "Омск"),
    ("краснодара", "Краснодар"),
    ("сочи", "Сочи"),
    ("питера", "Санкт-Петербург"),
];

/// Domain words that look like place candidates but never are.
pub const NOT_CITIES: &[&str] = &[
    // time
    "мин", "час", "сегодня", "завтра", "вчера", "утро", "утром", "день", "днём", "вечер",
    "вечером", "ночь", "ночью",
    // calendar
    "январь", "февраль", "март", "апрель", "май", "июнь", "июль", "август", "сентябрь",
    "октябрь", "ноябрь", "декабрь", "понедельник", "вторник", "среда", "четверг", "пятница",
    "суббота", "воскресенье",
    // people / luggage
    "чел", "человек", "человека", "пассажир", "пассажира", "пассажиров", "место", "места",
    "багаж", "багажа", "детское", "кресло", "животное", "питомец",
    // money
    "руб", "рубль", "рублей", "тыс", "цена", "стоимость", "торг", "договорная", "договор",
    "нал", "наличные", "карта", "перевод", "оплата",
    // vehicle / class
    "такси", "водитель", "машина", "авто", "автомобиль", "комфорт", "эконом", "бизнес",
    "премиум", "минивен",
    // route jargon
    "межгород", "междугороднее", "туда", "обратно", "попутно", "трансфер", "заказ",
    "заявка", "бронь", "бронирование", "срочно", "свободно", "занято", "закрыт", "закрыто",
    "открыт", "открыто",
    // admin geography
    "россия", "область", "край", "республика", "округ",
    // infrastructure
    "жд", "аэропорт", "вокзал", "станция", "остановка", "отель",
    "услуга", "услуги", "сервис",
];

/// Cheap pre-filter keywords: a message containing one of these is worth
/// running through location extraction.
pub const ORDER_KEYWORDS: &[&str] = &[
    "заказ",
    "заявка",
    "нужна машина",
    "нужен водитель",
    "ищу машину",
    "ищу водителя",
    "кто повезет",
    "кто повезёт",
    "кто возьмет",
    "кто возьмёт",
    "отвезти",
    "довезти",
    "подвезти",
    "увезти",
    "поездка",
    "межгород",
    "трансфер",
    "пассажир",
];

/// Markers of an already-taken or cancelled order; any hit rejects the
/// message outright.
pub const CLOSED_MARKERS: &[&str] = &[
    "закрыт",
    "закрыто",
    "закрыли",
    "неактуально",
    "не актуально",
    "выполнен",
    "выполнено",
    "отменен",
    "отменён",
    "отмена",
    "снят",
    "машина найдена",
    "водитель найден",
    "заказ взят",
    "взяли",
    "уехал",
    "уехали",
];

/// Macro-region name lists for best-effort segmentation. Never gates order
/// validity.
pub const REGIONS: &[(&str, &[&str])] = &[
    (
        "ural",
        &[
            "урал", "свердловск", "екатеринбург", "челябинск", "магнитогорск", "тюмень",
            "курган", "пермь",
        ],
    ),
    (
        "povolzhye",
        &[
            "поволжье", "башкортостан", "башкирия", "татарстан", "уфа", "казань", "самара",
            "саратов", "ульяновск", "пенза", "оренбург", "ижевск", "удмуртия", "чувашия",
        ],
    ),
    (
        "siberia",
        &[
            "сибирь", "новосибирск", "омск", "томск", "кемерово", "алтай", "красноярск",
            "иркутск",
        ],
    ),
    (
        "south",
        &[
            "кубань", "краснодар", "сочи", "ростов", "ставрополь", "кавказ", "анапа",
            "геленджик", "новороссийск",
        ],
    ),
    (
        "center",
        &[
            "москва", "подмосковье", "тула", "тверь", "ярославль", "владимир", "рязань",
            "воронеж", "белгород", "курск", "смоленск",
        ],
    ),
];

/// Street-address lead words; a dash-pattern side starting with one of these
/// is an address, not a city.
pub const STREET_WORDS: &[&str] = &[
    "улица", "ул", "проспект", "пр", "переулок", "пер", "бульвар", "бул", "площадь", "пл",
    "шоссе", "ш", "набережная", "наб", "аллея", "дом", "д", "квартира", "кв", "корпус",
    "корп", "строение", "стр", "офис", "оф",
];

use chrono::{DateTime, Duration, Utc};

use bazaar_core::domain::item::{CatalogItem, ItemId, ItemStatus};
use bazaar_core::domain::persona::{PersonaId, PersonaProfile};
use bazaar_core::domain::user::{UserAccount, UserId};

use crate::repositories::{RepositoryError, RepositorySet};

/// The gacha catalog shipped with every install.
pub fn persona_catalog() -> Vec<PersonaProfile> {
    vec![
        PersonaProfile {
            id: PersonaId(1),
            name: "ドット絵の青年".to_string(),
            description: "デフォルトのAIアシスタントです。".to_string(),
            system_prompt: "あなたはフリマアプリの親切で実直な案内人です。一人称は「僕」です。\
                            ユーザーのことを「お客さん」と呼びます。\
                            言葉遣いは少し砕けた敬語を使ってください。"
                .to_string(),
            avatar_url: "/avatars/model1.png".to_string(),
            theme_color: "#1976d2".to_string(),
            rarity: 1,
            fallback_line: Some(
                "ごめんね、お客さん。今ちょっと調子が悪いみたいなんだ。少ししてからまた話しかけてね。"
                    .to_string(),
            ),
        },
        PersonaProfile {
            id: PersonaId(2),
            name: "強気なギャル".to_string(),
            description: "マジで頼りになるギャル店員。".to_string(),
            system_prompt: "あなたはフリマアプリのカリスマ店員であるギャルです。一人称は「ウチ」です。\
                            口調は「〜だし」「ウケる」「マジで？」などを使います。\
                            フレンドリーかつ強気に接客してください。"
                .to_string(),
            avatar_url: "/avatars/gal.png".to_string(),
            theme_color: "#e91e63".to_string(),
            rarity: 2,
            fallback_line: Some(
                "ごめん、ウチ今ちょっと電波悪いっぽい！また後で話しかけてほしいし！".to_string(),
            ),
        },
        PersonaProfile {
            id: PersonaId(3),
            name: "老練な執事".to_string(),
            description: "あなたの出品を完璧にサポートします。".to_string(),
            system_prompt: "あなたは英国紳士風の執事です。一人称は「私（わたくし）」です。\
                            ユーザーを「ご主人様」または「お嬢様」と呼びます。\
                            「〜でございます」「お任せください」などの口調で接してください。"
                .to_string(),
            avatar_url: "/avatars/butler.png".to_string(),
            theme_color: "#212121".to_string(),
            rarity: 3,
            fallback_line: Some(
                "申し訳ございません、ご主人様。ただいま少々立て込んでおります。後ほど改めてお声がけくださいませ。"
                    .to_string(),
            ),
        },
    ]
}

pub fn demo_users() -> Vec<UserAccount> {
    vec![
        UserAccount::new(UserId(1), "Seller A", 1000),
        UserAccount::new(UserId(2), "Buyer B", 300),
        UserAccount::new(UserId(3), "User C", 0),
    ]
}

struct SeedItem {
    id: i64,
    name: &'static str,
    description: &'static str,
    price: i64,
    category: &'static str,
    condition: &'static str,
    sold: bool,
}

const SEED_ITEMS: &[SeedItem] = &[
    SeedItem {
        id: 1,
        name: "Nike sneaker",
        description: "blue running shoe, lightweight",
        price: 6800,
        category: "靴",
        condition: "目立った傷や汚れなし",
        sold: false,
    },
    SeedItem {
        id: 2,
        name: "Nike sneaker",
        description: "red running shoe for daily training",
        price: 7200,
        category: "靴",
        condition: "未使用に近い",
        sold: false,
    },
    SeedItem {
        id: 3,
        name: "wool sweater",
        description: "warm winter clothing, size M",
        price: 3500,
        category: "ファッション",
        condition: "やや傷や汚れあり",
        sold: false,
    },
    SeedItem {
        id: 4,
        name: "人気のスニーカー",
        description: "ランニングに最適な歩きやすいスニーカーです。",
        price: 5400,
        category: "靴",
        condition: "新品、未使用",
        sold: false,
    },
    SeedItem {
        id: 5,
        name: "最高級ジャケット",
        description: "冬物のおしゃれなジャケット。ビンテージ感があります。",
        price: 12000,
        category: "ファッション",
        condition: "目立った傷や汚れなし",
        sold: false,
    },
    SeedItem {
        id: 6,
        name: "Sony wireless headphones",
        description: "Bluetooth ヘッドホン 動作確認済み",
        price: 9800,
        category: "家電・スマホ・カメラ",
        condition: "未使用に近い",
        sold: false,
    },
    SeedItem {
        id: 7,
        name: "ゲーミングキーボード",
        description: "メカニカル RGB USB-C 対応の静音キーボード",
        price: 8600,
        category: "PC周辺機器",
        condition: "目立った傷や汚れなし",
        sold: false,
    },
    SeedItem {
        id: 8,
        name: "Logicool mouse",
        description: "ワイヤレス ゲーミングマウス 軽量",
        price: 4200,
        category: "PC周辺機器",
        condition: "やや傷や汚れあり",
        sold: false,
    },
    SeedItem {
        id: 9,
        name: "Apple カメラ充電器",
        description: "コンパクトな充電器、まとめ売り",
        price: 1500,
        category: "家電・スマホ・カメラ",
        condition: "傷や汚れあり",
        sold: true,
    },
    SeedItem {
        id: 10,
        name: "謎のフィギュア",
        description: "レアもののアンティークフィギュアです。",
        price: 2600,
        category: "その他",
        condition: "全体的に状態が悪い",
        sold: false,
    },
    SeedItem {
        id: 11,
        name: "leather boots",
        description: "防水 レザー ブーツ, casual",
        price: 8900,
        category: "靴",
        condition: "目立った傷や汚れなし",
        sold: false,
    },
    SeedItem {
        id: 12,
        name: "Uniqlo down coat",
        description: "winter coat, light and warm",
        price: 4800,
        category: "ファッション",
        condition: "未使用に近い",
        sold: true,
    },
];

/// Demo catalog; item 1 is the oldest and item 12 the newest relative to `now`.
pub fn demo_items(now: DateTime<Utc>) -> Vec<CatalogItem> {
    let count = SEED_ITEMS.len() as i64;
    SEED_ITEMS
        .iter()
        .map(|seed| CatalogItem {
            id: ItemId(seed.id),
            seller_id: Some(UserId(1)),
            name: seed.name.to_string(),
            description: seed.description.to_string(),
            price: seed.price,
            category: Some(seed.category.to_string()),
            condition: Some(seed.condition.to_string()),
            status: if seed.sold { ItemStatus::Sold } else { ItemStatus::OnSale },
            created_at: now - Duration::hours(count - seed.id + 1),
        })
        .collect()
}

/// Sold demo items were bought by Buyer B; item 12 is the most recent purchase.
pub fn demo_purchases(now: DateTime<Utc>) -> Vec<(ItemId, UserId, DateTime<Utc>)> {
    SEED_ITEMS
        .iter()
        .filter(|seed| seed.sold)
        .map(|seed| (ItemId(seed.id), UserId(2), now - Duration::minutes(20 - seed.id)))
        .collect()
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SeedResult {
    pub personas_seeded: usize,
    pub users_seeded: usize,
    pub items_seeded: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerificationResult {
    pub all_present: bool,
    pub checks: Vec<(String, bool)>,
}

/// Deterministic marketplace fixtures: persona catalog, three users and a mixed
/// English/Japanese item catalog. Buyer B owns the default persona without having
/// equipped it and has bought the sold items.
pub struct MarketplaceSeedDataset;

impl MarketplaceSeedDataset {
    pub async fn load(repos: &RepositorySet) -> Result<SeedResult, RepositoryError> {
        let personas = persona_catalog();
        let users = demo_users();
        let now = Utc::now();
        let items = demo_items(now);
        let result = SeedResult {
            personas_seeded: personas.len(),
            users_seeded: users.len(),
            items_seeded: items.len(),
        };

        for persona in personas.iter().cloned() {
            repos.personas.save(persona).await?;
        }
        for user in users {
            repos.users.save(user).await?;
        }
        for item in items {
            repos.items.save(item).await?;
        }
        for (item_id, buyer_id, sold_at) in demo_purchases(now) {
            repos.items.record_purchase(item_id, buyer_id, sold_at).await?;
        }

        let owns_default = repos
            .personas
            .persona_state(UserId(2))
            .await?
            .is_some_and(|state| state.owns(PersonaId(1)));
        if !owns_default {
            repos.wallet.grant_persona(UserId(2), &personas[0]).await?;
        }

        Ok(result)
    }

    pub async fn verify(repos: &RepositorySet) -> Result<VerificationResult, RepositoryError> {
        let mut checks = Vec::new();

        for persona in persona_catalog() {
            let present = repos.personas.find_by_id(persona.id).await?.is_some();
            checks.push((format!("persona:{}", persona.id.0), present));
        }
        for user in demo_users() {
            let present = repos.users.find_by_id(user.id).await?.is_some();
            checks.push((format!("user:{}", user.id.0), present));
        }
        for item in demo_items(Utc::now()) {
            let present = repos.items.find_by_id(item.id).await?.is_some();
            checks.push((format!("item:{}", item.id.0), present));
        }

        let buyer_owns_default = repos
            .personas
            .persona_state(UserId(2))
            .await?
            .is_some_and(|state| state.owns(PersonaId(1)));
        checks.push(("ownership:buyer-default".to_string(), buyer_owns_default));

        let buyer_has_purchase = repos.items.latest_purchase(UserId(2)).await?.is_some();
        checks.push(("purchase:buyer-latest".to_string(), buyer_has_purchase));

        let all_present = checks.iter().all(|(_, present)| *present);
        Ok(VerificationResult { all_present, checks })
    }
}
